//! Time-block aggregation filters.
//!
//! Each driver consumes trade blocks in strict time order and emits one
//! filter point per block. Price-like filters carry the previous point
//! forward over empty blocks (with the carried copy's timestamp rewritten;
//! earlier points are inserted by value and never mutated); a leading run
//! of empty blocks emits nothing. The IR variants additionally carry
//! forward when the computed value is not positive.

use chrono::{DateTime, Utc};

use crate::types::{Asset, FilterPoint, FilterPointMetadata, Trade, TradeBlock};

/// Per-block filter folded over a block's trades.
trait TradeFilter {
    fn compute(&mut self, trade: &Trade);
    fn final_compute(&mut self, time: DateTime<Utc>) -> f64;
    fn filter_point_for_block(&self) -> FilterPoint;
}

fn block_time(block: &TradeBlock) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(block.time_stamp)
}

fn run_trade_filter<F, New>(
    blocks: &[TradeBlock],
    new_filter: New,
    carry_on_nonpositive: bool,
) -> (Vec<FilterPoint>, FilterPointMetadata)
where
    F: TradeFilter,
    New: Fn(DateTime<Utc>) -> F,
{
    let mut points = Vec::new();
    let mut last_point: Option<FilterPoint> = None;
    let mut metadata = FilterPointMetadata::new();

    for block in blocks {
        let time = block_time(block);

        if block.trades.is_empty() {
            if let Some(prev) = &last_point {
                let mut carried = prev.clone();
                carried.time = time;
                points.push(carried);
            }
            continue;
        }

        let mut filter = new_filter(time);
        for trade in &block.trades {
            filter.compute(trade);
        }
        filter.final_compute(time);

        let mut point = filter.filter_point_for_block();
        metadata.add_point(point.value);
        point.time = time;
        point.first_trade = block.trades.first().cloned();
        point.last_trade = block.trades.last().cloned();

        if carry_on_nonpositive && point.value <= 0.0 {
            if let Some(prev) = &last_point {
                let mut carried = prev.clone();
                carried.time = time;
                points.push(carried);
            }
            continue;
        }

        points.push(point.clone());
        last_point = Some(point);
    }

    (points, metadata)
}

// ----------------------------------------------------------------------
// Statistics helpers
// ----------------------------------------------------------------------

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Linear-interpolated quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let position = (n - 1) as f64 * q;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Keep indices whose price survives the 1.5-IQR fences. Samples too small
/// for meaningful quartiles pass through untouched.
fn iqr_surviving_indices(prices: &[f64]) -> Vec<usize> {
    if prices.len() < 4 {
        return (0..prices.len()).collect();
    }
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let fence = 1.5 * (q3 - q1);
    let (low, high) = (q1 - fence, q3 + fence);
    prices
        .iter()
        .enumerate()
        .filter(|(_, p)| **p >= low && **p <= high)
        .map(|(i, _)| i)
        .collect()
}

// ----------------------------------------------------------------------
// Filter variants
// ----------------------------------------------------------------------

/// Arithmetic mean of trade prices; `trim` applies the IQR fences first.
struct MaFilter {
    asset: Asset,
    name: String,
    time: DateTime<Utc>,
    prices: Vec<f64>,
    trim: bool,
    value: f64,
}

impl MaFilter {
    fn new(asset: Asset, time: DateTime<Utc>, block_size: u64, trim: bool) -> Self {
        let name = if trim {
            format!("MAIR{block_size}")
        } else {
            format!("MA{block_size}")
        };
        Self {
            asset,
            name,
            time,
            prices: Vec::new(),
            trim,
            value: 0.0,
        }
    }
}

impl TradeFilter for MaFilter {
    fn compute(&mut self, trade: &Trade) {
        self.prices.push(trade.price);
    }

    fn final_compute(&mut self, time: DateTime<Utc>) -> f64 {
        self.time = time;
        self.value = if self.trim {
            let surviving = iqr_surviving_indices(&self.prices);
            let trimmed: Vec<f64> = surviving.iter().map(|&i| self.prices[i]).collect();
            mean(&trimmed)
        } else {
            mean(&self.prices)
        };
        self.value
    }

    fn filter_point_for_block(&self) -> FilterPoint {
        FilterPoint {
            asset: self.asset.clone(),
            value: self.value,
            name: self.name.clone(),
            time: self.time,
            first_trade: None,
            last_trade: None,
        }
    }
}

/// Volume-weighted average price over absolute traded volumes.
struct VwapFilter {
    asset: Asset,
    name: String,
    time: DateTime<Utc>,
    prices: Vec<f64>,
    volumes: Vec<f64>,
    trim: bool,
    value: f64,
}

impl VwapFilter {
    fn new(asset: Asset, time: DateTime<Utc>, block_size: u64, trim: bool) -> Self {
        let name = if trim {
            format!("VWAPIR{block_size}")
        } else {
            format!("VWAP{block_size}")
        };
        Self {
            asset,
            name,
            time,
            prices: Vec::new(),
            volumes: Vec::new(),
            trim,
            value: 0.0,
        }
    }
}

impl TradeFilter for VwapFilter {
    fn compute(&mut self, trade: &Trade) {
        self.prices.push(trade.price);
        self.volumes.push(trade.volume.abs());
    }

    fn final_compute(&mut self, time: DateTime<Utc>) -> f64 {
        self.time = time;
        let surviving = if self.trim {
            iqr_surviving_indices(&self.prices)
        } else {
            (0..self.prices.len()).collect()
        };

        let total_volume: f64 = surviving.iter().map(|&i| self.volumes[i]).sum();
        self.value = if total_volume > 0.0 {
            surviving
                .iter()
                .map(|&i| self.prices[i] * self.volumes[i])
                .sum::<f64>()
                / total_volume
        } else {
            0.0
        };
        self.value
    }

    fn filter_point_for_block(&self) -> FilterPoint {
        FilterPoint {
            asset: self.asset.clone(),
            value: self.value,
            name: self.name.clone(),
            time: self.time,
            first_trade: None,
            last_trade: None,
        }
    }
}

/// Median price after IQR trimming.
struct MedirFilter {
    asset: Asset,
    name: String,
    time: DateTime<Utc>,
    prices: Vec<f64>,
    value: f64,
}

impl MedirFilter {
    fn new(asset: Asset, time: DateTime<Utc>, block_size: u64) -> Self {
        Self {
            asset,
            name: format!("MEDIR{block_size}"),
            time,
            prices: Vec::new(),
            value: 0.0,
        }
    }
}

impl TradeFilter for MedirFilter {
    fn compute(&mut self, trade: &Trade) {
        self.prices.push(trade.price);
    }

    fn final_compute(&mut self, time: DateTime<Utc>) -> f64 {
        self.time = time;
        let surviving = iqr_surviving_indices(&self.prices);
        let mut trimmed: Vec<f64> = surviving.iter().map(|&i| self.prices[i]).collect();
        trimmed.sort_by(|a, b| a.total_cmp(b));
        self.value = median(&trimmed);
        self.value
    }

    fn filter_point_for_block(&self) -> FilterPoint {
        FilterPoint {
            asset: self.asset.clone(),
            value: self.value,
            name: self.name.clone(),
            time: self.time,
            first_trade: None,
            last_trade: None,
        }
    }
}

/// Total absolute volume traded in the block.
struct VolFilter {
    asset: Asset,
    name: String,
    time: DateTime<Utc>,
    value: f64,
}

impl VolFilter {
    fn new(asset: Asset, time: DateTime<Utc>, block_size: u64) -> Self {
        Self {
            asset,
            name: format!("VOL{block_size}"),
            time,
            value: 0.0,
        }
    }
}

impl TradeFilter for VolFilter {
    fn compute(&mut self, trade: &Trade) {
        self.value += trade.volume.abs();
    }

    fn final_compute(&mut self, time: DateTime<Utc>) -> f64 {
        self.time = time;
        self.value
    }

    fn filter_point_for_block(&self) -> FilterPoint {
        FilterPoint {
            asset: self.asset.clone(),
            value: self.value,
            name: self.name.clone(),
            time: self.time,
            first_trade: None,
            last_trade: None,
        }
    }
}

/// Exponential moving average over an already-produced point series.
struct EmaFilter {
    asset: Asset,
    name: String,
    time: DateTime<Utc>,
    alpha: f64,
    current: Option<f64>,
}

impl EmaFilter {
    fn new(asset: Asset, time: DateTime<Utc>, block_size: u64) -> Self {
        Self {
            asset,
            name: format!("EMA{block_size}"),
            time,
            alpha: 2.0 / (block_size as f64 + 1.0),
            current: None,
        }
    }

    fn compute(&mut self, point: &FilterPoint) {
        self.current = Some(match self.current {
            Some(previous) => previous + self.alpha * (point.value - previous),
            None => point.value,
        });
    }

    fn final_compute(&mut self, time: DateTime<Utc>) -> f64 {
        self.time = time;
        self.current.unwrap_or(0.0)
    }

    fn filter_point_for_block(&self) -> FilterPoint {
        FilterPoint {
            asset: self.asset.clone(),
            value: self.current.unwrap_or(0.0),
            name: self.name.clone(),
            time: self.time,
            first_trade: None,
            last_trade: None,
        }
    }
}

// ----------------------------------------------------------------------
// Drivers
// ----------------------------------------------------------------------

pub fn filter_ma(
    blocks: &[TradeBlock],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    run_trade_filter(
        blocks,
        |time| MaFilter::new(asset.clone(), time, block_size, false),
        false,
    )
}

pub fn filter_mair(
    blocks: &[TradeBlock],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    run_trade_filter(
        blocks,
        |time| MaFilter::new(asset.clone(), time, block_size, true),
        false,
    )
}

pub fn filter_vwap(
    blocks: &[TradeBlock],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    run_trade_filter(
        blocks,
        |time| VwapFilter::new(asset.clone(), time, block_size, false),
        false,
    )
}

pub fn filter_vwapir(
    blocks: &[TradeBlock],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    run_trade_filter(
        blocks,
        |time| VwapFilter::new(asset.clone(), time, block_size, true),
        true,
    )
}

pub fn filter_medir(
    blocks: &[TradeBlock],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    run_trade_filter(
        blocks,
        |time| MedirFilter::new(asset.clone(), time, block_size),
        true,
    )
}

/// Volume has no carry-forward: an empty block traded nothing.
pub fn filter_vol(
    blocks: &[TradeBlock],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    let mut points = Vec::new();
    let mut metadata = FilterPointMetadata::new();

    for block in blocks {
        if block.trades.is_empty() {
            continue;
        }
        let time = block_time(block);
        let mut filter = VolFilter::new(asset.clone(), time, block_size);
        for trade in &block.trades {
            filter.compute(trade);
        }
        filter.final_compute(time);

        let mut point = filter.filter_point_for_block();
        metadata.add_point(point.value);
        point.time = time;
        point.first_trade = block.trades.first().cloned();
        point.last_trade = block.trades.last().cloned();
        points.push(point);
    }

    (points, metadata)
}

/// EMA over a point series. Points are folded into the exponential state
/// except at every 5th index, where the state is materialized first and
/// emitted if positive. The index-0 materialization therefore precedes the
/// first fold; that cadence is deliberate and matched against the
/// reference publication pipeline.
pub fn filter_ema(
    points: &[FilterPoint],
    asset: &Asset,
    block_size: u64,
) -> (Vec<FilterPoint>, FilterPointMetadata) {
    let mut metadata = FilterPointMetadata::new();
    let Some(first) = points.first() else {
        return (Vec::new(), metadata);
    };

    let mut ema = EmaFilter::new(asset.clone(), first.time, block_size);
    let mut out = Vec::new();

    for (index, point) in points.iter().enumerate() {
        if index % 5 == 0 {
            ema.final_compute(point.time);
            let emitted = ema.filter_point_for_block();
            metadata.add_point(emitted.value);
            if emitted.value > 0.0 {
                out.push(emitted);
            }
        } else {
            ema.compute(point);
        }
    }

    (out, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ETHEREUM;
    use chrono::Utc;

    fn asset() -> Asset {
        Asset {
            symbol: "WETH".into(),
            blockchain: ETHEREUM.into(),
            ..Asset::default()
        }
    }

    fn trade(price: f64, volume: f64) -> Trade {
        Trade {
            symbol: "WETH".into(),
            pair: "WETH-USDC".into(),
            price,
            volume,
            time: Utc::now(),
            foreign_trade_id: String::new(),
            source: "test".into(),
            base_token: Asset::default(),
            quote_token: Asset::default(),
            verified_pair: true,
        }
    }

    fn block(ts_nanos: i64, trades: Vec<Trade>) -> TradeBlock {
        TradeBlock {
            time_stamp: ts_nanos,
            trades,
        }
    }

    const NS: i64 = 1_000_000_000;

    #[test]
    fn ma_is_the_mean_of_block_prices() {
        let blocks = vec![block(100 * NS, vec![trade(10.0, 1.0), trade(20.0, 2.0)])];
        let (points, metadata) = filter_ma(&blocks, &asset(), 120);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 15.0);
        assert_eq!(points[0].name, "MA120");
        assert_eq!(metadata.min, 15.0);
        assert!(points[0].first_trade.is_some());
    }

    #[test]
    fn empty_block_carries_previous_point_with_rewritten_time() {
        // Scenario: [B1(trades), B2(empty), B3(trades)].
        let blocks = vec![
            block(100 * NS, vec![trade(10.0, 1.0), trade(30.0, 1.0)]),
            block(220 * NS, vec![]),
            block(340 * NS, vec![trade(50.0, 2.0)]),
        ];
        let (points, _) = filter_vwap(&blocks, &asset(), 120);
        assert_eq!(points.len(), 3);
        assert_eq!(points[1].value, points[0].value);
        assert_eq!(points[1].time, DateTime::from_timestamp_nanos(220 * NS));
        assert_eq!(points[2].value, 50.0);
    }

    #[test]
    fn carry_forward_does_not_mutate_earlier_points() {
        let blocks = vec![
            block(100 * NS, vec![trade(10.0, 1.0)]),
            block(220 * NS, vec![]),
            block(340 * NS, vec![]),
        ];
        let (points, _) = filter_ma(&blocks, &asset(), 120);
        assert_eq!(points.len(), 3);
        // each point keeps its own block's timestamp
        assert_eq!(points[0].time, DateTime::from_timestamp_nanos(100 * NS));
        assert_eq!(points[1].time, DateTime::from_timestamp_nanos(220 * NS));
        assert_eq!(points[2].time, DateTime::from_timestamp_nanos(340 * NS));
    }

    #[test]
    fn leading_empty_blocks_emit_nothing() {
        let blocks = vec![
            block(100 * NS, vec![]),
            block(220 * NS, vec![]),
            block(340 * NS, vec![trade(42.0, 1.0)]),
        ];
        let (points, _) = filter_ma(&blocks, &asset(), 120);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 42.0);
    }

    #[test]
    fn vwap_weights_by_absolute_volume() {
        let blocks = vec![block(
            100 * NS,
            vec![trade(10.0, 1.0), trade(20.0, -3.0)],
        )];
        let (points, _) = filter_vwap(&blocks, &asset(), 120);
        // (10*1 + 20*3) / 4
        assert_eq!(points[0].value, 17.5);
    }

    #[test]
    fn mair_trims_outliers_before_the_mean() {
        let mut trades: Vec<Trade> = (0..8).map(|_| trade(10.0, 1.0)).collect();
        trades.push(trade(10_000.0, 1.0));
        let blocks = vec![block(100 * NS, trades)];

        let (plain, _) = filter_ma(&blocks, &asset(), 120);
        let (trimmed, _) = filter_mair(&blocks, &asset(), 120);
        assert!(plain[0].value > 1000.0);
        assert_eq!(trimmed[0].value, 10.0);
    }

    #[test]
    fn medir_takes_the_median_of_surviving_prices() {
        let blocks = vec![block(
            100 * NS,
            vec![
                trade(9.0, 1.0),
                trade(10.0, 1.0),
                trade(11.0, 1.0),
                trade(10.5, 1.0),
                trade(5_000.0, 1.0),
            ],
        )];
        let (points, _) = filter_medir(&blocks, &asset(), 120);
        assert_eq!(points[0].value, 10.25);
    }

    #[test]
    fn vwapir_carries_forward_on_nonpositive_value() {
        let blocks = vec![
            block(100 * NS, vec![trade(10.0, 2.0)]),
            // all volume zero -> computed value 0 -> carry previous
            block(220 * NS, vec![trade(99.0, 0.0)]),
        ];
        let (points, _) = filter_vwapir(&blocks, &asset(), 120);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, 10.0);
        assert_eq!(points[1].time, DateTime::from_timestamp_nanos(220 * NS));
    }

    #[test]
    fn vol_sums_absolute_volumes_and_skips_empty_blocks() {
        let blocks = vec![
            block(100 * NS, vec![trade(10.0, 2.0), trade(11.0, -3.0)]),
            block(220 * NS, vec![]),
        ];
        let (points, _) = filter_vol(&blocks, &asset(), 120);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 5.0);
    }

    #[test]
    fn ema_emits_every_fifth_index() {
        let points: Vec<FilterPoint> = (0..11)
            .map(|i| FilterPoint {
                asset: asset(),
                value: 100.0,
                name: "MA120".into(),
                time: DateTime::from_timestamp_nanos((100 + i * 120) * NS),
                first_trade: None,
                last_trade: None,
            })
            .collect();

        let (out, metadata) = filter_ema(&points, &asset(), 2);
        // index 0 materializes before any fold (state empty, not emitted);
        // indices 5 and 10 emit the converged state.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, 100.0);
        assert_eq!(out[0].time, points[5].time);
        assert_eq!(out[1].time, points[10].time);
        assert_eq!(metadata.min, 0.0);
        assert_eq!(metadata.max, 100.0);
    }

    #[test]
    fn ema_tracks_a_step_change() {
        let mut values = vec![100.0; 6];
        values.extend(vec![200.0; 5]);
        let points: Vec<FilterPoint> = values
            .iter()
            .enumerate()
            .map(|(i, v)| FilterPoint {
                asset: asset(),
                value: *v,
                name: "MA120".into(),
                time: DateTime::from_timestamp_nanos((100 + i as i64 * 120) * NS),
                first_trade: None,
                last_trade: None,
            })
            .collect();

        let (out, _) = filter_ema(&points, &asset(), 2);
        assert_eq!(out.len(), 2);
        // second emission has moved most of the way to 200 (alpha = 2/3)
        assert!(out[1].value > 150.0 && out[1].value < 200.0);
    }
}
