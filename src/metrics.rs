//! Per-simulation metrics rows and the per-cell distributional summary.

use serde::{Deserialize, Serialize};

use crate::grid::CellParams;

/// Reported for a profit factor whose loss denominator is zero.
pub const PF_SENTINEL: f64 = 1e9;

/// One simulation's summary. `perm_index` is the primary key within a
/// cell; rows are bit-reproducible for a fixed (seed, cell, index).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsRow {
    pub perm_index: u32,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub worst_month_pct: f64,
    pub trades_executed: u32,
}

impl MetricsRow {
    pub const CSV_HEADER: &'static str =
        "perm_index,total_return_pct,max_drawdown_pct,profit_factor,worst_month_pct,trades";

    /// Canonical serialization. Fixed-precision so that a parse/rewrite
    /// round trip (dedupe) is byte-stable.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{:.6},{}",
            self.perm_index,
            self.total_return_pct,
            self.max_drawdown_pct,
            self.profit_factor,
            self.worst_month_pct,
            self.trades_executed
        )
    }

    /// Parse one CSV line; `None` for anything malformed (headers,
    /// partial tails from a crash mid-append).
    pub fn parse_csv_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end().split(',');
        let perm_index = fields.next()?.parse().ok()?;
        let total_return_pct = fields.next()?.parse().ok()?;
        let max_drawdown_pct = fields.next()?.parse().ok()?;
        let profit_factor = fields.next()?.parse().ok()?;
        let worst_month_pct = fields.next()?.parse().ok()?;
        let trades_executed = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            perm_index,
            total_return_pct,
            max_drawdown_pct,
            profit_factor,
            worst_month_pct,
            trades_executed,
        })
    }
}

/// Distribution summary for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub p05: f64,
    pub p50: f64,
    pub p95: f64,
    pub mean: f64,
    pub std: f64,
}

/// Linear-interpolation percentile over a sorted slice.
pub fn percentile(sorted: &[f64], p01: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let p = p01.clamp(0.0, 1.0);
    let idx = p * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let w = idx - lo as f64;
    sorted[lo] * (1.0 - w) + sorted[hi] * w
}

pub fn summarize(values: &[f64]) -> MetricSummary {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return MetricSummary {
            p05: f64::NAN,
            p50: f64::NAN,
            p95: f64::NAN,
            mean: f64::NAN,
            std: f64::NAN,
        };
    }
    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let var = sorted.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    MetricSummary {
        p05: percentile(&sorted, 0.05),
        p50: percentile(&sorted, 0.50),
        p95: percentile(&sorted, 0.95),
        mean,
        std: var.sqrt(),
    }
}

/// Integrity accounting from the dedupe pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Integrity {
    pub n_rows_raw: u64,
    pub n_duplicates_dropped: u64,
    pub n_rows_deduped: u64,
}

/// Final per-cell statistics, written atomically as `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSummary {
    pub cell_id: String,
    pub params: CellParams,
    pub n_target: u32,
    pub n_perms_done: u64,
    #[serde(flatten)]
    pub integrity: Integrity,
    /// Simulations that could not reach the minimum executed-trade count.
    pub n_degenerate: u64,
    /// Simulations whose profit factor hit the zero-loss sentinel.
    pub n_pf_sentinel: u64,
    pub total_return_pct: MetricSummary,
    pub max_drawdown_pct: MetricSummary,
    pub profit_factor: MetricSummary,
    pub worst_month_pct: MetricSummary,
    pub trades_executed: MetricSummary,
    pub baseline_pf: f64,
    pub p_raw: f64,
    pub p_corrected: f64,
    pub robust_score: f64,
    pub finished_at: String,
}

impl CellSummary {
    /// Reduce a deduped row set to the final summary.
    ///
    /// The p-value is the permutation-test form: the share of degraded
    /// simulations whose profit factor still reaches the baseline (small
    /// means the baseline result is unlikely to be luck), Bonferroni
    /// corrected across the filtered grid.
    pub fn compute(
        cell_id: &str,
        params: CellParams,
        n_target: u32,
        rows: &[MetricsRow],
        integrity: Integrity,
        min_trades: u32,
        baseline_pf: f64,
        n_cells: usize,
        finished_at: String,
    ) -> Self {
        let col = |f: fn(&MetricsRow) -> f64| -> Vec<f64> { rows.iter().map(f).collect() };

        let n_degenerate = rows
            .iter()
            .filter(|r| r.trades_executed < min_trades)
            .count() as u64;
        let n_pf_sentinel = rows
            .iter()
            .filter(|r| r.profit_factor >= PF_SENTINEL)
            .count() as u64;

        let n = rows.len() as f64;
        let n_at_baseline = rows
            .iter()
            .filter(|r| r.profit_factor >= baseline_pf)
            .count() as f64;
        let p_raw = (1.0 + n_at_baseline) / (n + 1.0);
        let p_corrected = (p_raw * n_cells as f64).min(1.0);

        let profit_factor = summarize(&col(|r| r.profit_factor));
        let robust_score = profit_factor.p50 * (1.0 - p_corrected);

        Self {
            cell_id: cell_id.to_string(),
            params,
            n_target,
            n_perms_done: rows.len() as u64,
            integrity,
            n_degenerate,
            n_pf_sentinel,
            total_return_pct: summarize(&col(|r| r.total_return_pct)),
            max_drawdown_pct: summarize(&col(|r| r.max_drawdown_pct)),
            profit_factor,
            worst_month_pct: summarize(&col(|r| r.worst_month_pct)),
            trades_executed: summarize(&col(|r| r.trades_executed as f64)),
            baseline_pf,
            p_raw,
            p_corrected,
            robust_score,
            finished_at,
        }
    }
}
