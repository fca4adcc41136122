//! Per-run derived state, computed once from the loaded inputs and shared
//! read-only by every cell: bar index lookups, the state-dependent
//! slippage signals, per-trade dollar risk, the empirical bar-return
//! series, and calendar-month keys.

use anyhow::{bail, Result};
use chrono::Datelike;
use std::collections::HashMap;

use crate::config::KernelConfig;
use crate::inputs::Inputs;

#[derive(Debug, Clone)]
pub struct Baseline {
    pub n_trades: usize,
    /// Entry/exit bar indices; populated only when OHLC data is present.
    pub entry_bar: Vec<usize>,
    pub exit_bar: Vec<usize>,
    pub has_bars: bool,
    /// Per-trade dollar risk R (input column or derived).
    pub risk_dollars: Vec<f64>,
    /// |entry_price * qty| per trade, for pct-mode slippage.
    pub notional: Vec<f64>,
    /// Percentile rank in [0,1] of rolling equity-return volatility at
    /// each trade's entry.
    pub vol_pct: Vec<f64>,
    /// Normalized drawdown depth in [0,1] at each trade's entry.
    pub dd_norm: Vec<f64>,
    /// UTC calendar month of each trade's exit, as year*12+month0.
    pub month_key: Vec<u32>,
    /// Empirical per-bar return series (equity curve step returns), the
    /// sampling pool for approximate-mode delay.
    pub bar_returns: Vec<f64>,
    pub initial_capital: f64,
}

impl Baseline {
    pub fn derive(inputs: &Inputs, cfg: &KernelConfig) -> Result<Self> {
        let trades = &inputs.trades;
        let equity = &inputs.equity;
        let n = trades.len();

        let initial_capital = cfg.initial_capital.unwrap_or(equity.equity[0]);
        if !(initial_capital > 0.0) {
            bail!("Initial capital must be positive, got {}", initial_capital);
        }

        // Bar index lookup is exact-match: a trade whose entry or exit
        // timestamp has no bar is an input error, caught here before any
        // kernel call.
        let (entry_bar, exit_bar, has_bars) = match &inputs.ohlc {
            Some(bars) => {
                let by_ts: HashMap<i64, usize> = bars
                    .time
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (t.timestamp_nanos_opt().unwrap_or_default(), i))
                    .collect();
                let mut entry = Vec::with_capacity(n);
                let mut exit = Vec::with_capacity(n);
                for i in 0..n {
                    let ek = trades.entry_time[i].timestamp_nanos_opt().unwrap_or_default();
                    let xk = trades.exit_time[i].timestamp_nanos_opt().unwrap_or_default();
                    let Some(&eb) = by_ts.get(&ek) else {
                        bail!("Trade {} entry_time {} has no matching OHLC bar", i, trades.entry_time[i]);
                    };
                    let Some(&xb) = by_ts.get(&xk) else {
                        bail!("Trade {} exit_time {} has no matching OHLC bar", i, trades.exit_time[i]);
                    };
                    entry.push(eb);
                    exit.push(xb);
                }
                (entry, exit, true)
            }
            None => (Vec::new(), Vec::new(), false),
        };

        let risk_dollars = match &trades.risk_dollars {
            Some(col) => col.clone(),
            None => vec![derive_risk(&trades.pnl); n],
        };

        let notional: Vec<f64> = (0..n)
            .map(|i| (trades.entry_price[i] * trades.qty[i]).abs())
            .collect();

        let bar_returns: Vec<f64> = equity
            .equity
            .windows(2)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();

        // Equity index at each trade's entry: last curve point at or
        // before the entry timestamp.
        let entry_eq_idx: Vec<usize> = (0..n)
            .map(|i| {
                let t = trades.entry_time[i];
                equity.time.partition_point(|et| *et <= t).saturating_sub(1)
            })
            .collect();

        let rolling_vol = rolling_std(&bar_returns, equity.equity.len(), cfg.vol_window);
        let vol_rank = percentile_ranks(&rolling_vol);
        let vol_pct: Vec<f64> = entry_eq_idx.iter().map(|&e| vol_rank[e]).collect();

        let dd = drawdown_depths(&equity.equity);
        let max_abs_dd = dd.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
        let dd_norm: Vec<f64> = entry_eq_idx
            .iter()
            .map(|&e| {
                if max_abs_dd > 0.0 {
                    dd[e].abs() / max_abs_dd
                } else {
                    0.0
                }
            })
            .collect();

        let month_key: Vec<u32> = trades
            .exit_time
            .iter()
            .map(|t| (t.year() * 12 + t.month0() as i32) as u32)
            .collect();

        Ok(Self {
            n_trades: n,
            entry_bar,
            exit_bar,
            has_bars,
            risk_dollars,
            notional,
            vol_pct,
            dd_norm,
            month_key,
            bar_returns,
            initial_capital,
        })
    }
}

/// R when the input has no risk_dollars column: median |PnL| over losing
/// trades, mean |PnL| when there are no losers, floored at 1.0 so
/// R-scaled caps stay meaningful on degenerate inputs.
fn derive_risk(pnl: &[f64]) -> f64 {
    let mut losses: Vec<f64> = pnl.iter().filter(|p| **p < 0.0).map(|p| p.abs()).collect();
    let r = if losses.is_empty() {
        pnl.iter().map(|p| p.abs()).sum::<f64>() / pnl.len() as f64
    } else {
        losses.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        losses[losses.len() / 2]
    };
    r.max(1.0)
}

/// Rolling standard deviation of the return series, evaluated at each
/// equity point. Point t sees the window of returns ending at t; fewer
/// than two samples yields 0.
fn rolling_std(returns: &[f64], n_points: usize, window: usize) -> Vec<f64> {
    let mut out = vec![0.0; n_points];
    for t in 0..n_points {
        // returns[j] is the step from point j to j+1; the window ending
        // at point t covers returns[t-window..t].
        let hi = t.min(returns.len());
        let lo = hi.saturating_sub(window);
        let slice = &returns[lo..hi];
        if slice.len() >= 2 {
            let mean = slice.iter().sum::<f64>() / slice.len() as f64;
            let var =
                slice.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / slice.len() as f64;
            out[t] = var.sqrt();
        }
    }
    out
}

/// Percentile rank in [0,1] of each value within the whole series.
fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n <= 1 {
        return vec![0.0; n];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values
        .iter()
        .map(|v| {
            let below = sorted.partition_point(|x| x < v);
            below as f64 / (n - 1) as f64
        })
        .map(|r| r.clamp(0.0, 1.0))
        .collect()
}

/// Peak-relative drawdown at each equity point (non-positive values).
fn drawdown_depths(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    equity
        .iter()
        .map(|&e| {
            peak = peak.max(e);
            (e - peak) / peak
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::{EquityCurve, Side, TradeList};
    use chrono::{TimeZone, Utc};

    fn ts(day: u32, hour: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn toy_inputs() -> Inputs {
        let mut trades = TradeList::default();
        for day in 1..=4 {
            trades.entry_time.push(ts(day, 10));
            trades.exit_time.push(ts(day, 12));
            trades.entry_price.push(100.0);
            trades.exit_price.push(101.0);
            trades.qty.push(1.0);
            trades.side.push(Side::Long);
            trades.pnl.push(if day == 3 { -4.0 } else { 10.0 });
        }
        let equity = EquityCurve {
            time: (1..=5).map(|d| ts(d, 0)).collect(),
            equity: vec![10_000.0, 10_010.0, 10_020.0, 10_016.0, 10_026.0],
        };
        Inputs {
            trades,
            equity,
            ohlc: None,
            report_pf: None,
        }
    }

    #[test]
    fn derives_initial_capital_from_curve() {
        let inputs = toy_inputs();
        let base = Baseline::derive(&inputs, &KernelConfig::default()).unwrap();
        assert_eq!(base.initial_capital, 10_000.0);
        assert_eq!(base.bar_returns.len(), 4);
    }

    #[test]
    fn dd_norm_peaks_at_one_in_deepest_drawdown() {
        let inputs = toy_inputs();
        let base = Baseline::derive(&inputs, &KernelConfig::default()).unwrap();
        // Day 4 entry sits at the single drawdown point of the curve.
        assert_eq!(base.dd_norm[3], 1.0);
        assert_eq!(base.dd_norm[0], 0.0);
        assert!(base.vol_pct.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn risk_defaults_to_median_loss() {
        let inputs = toy_inputs();
        let base = Baseline::derive(&inputs, &KernelConfig::default()).unwrap();
        assert_eq!(base.risk_dollars[0], 4.0);
    }

    #[test]
    fn month_keys_follow_exit_month() {
        let inputs = toy_inputs();
        let base = Baseline::derive(&inputs, &KernelConfig::default()).unwrap();
        assert!(base.month_key.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(base.month_key[0], (2024 * 12) as u32);
    }

    #[test]
    fn missing_bar_for_trade_is_fatal() {
        let mut inputs = toy_inputs();
        inputs.ohlc = Some(crate::inputs::OhlcSeries {
            time: vec![ts(1, 10)],
            open: vec![100.0],
            high: vec![101.0],
            low: vec![99.0],
            close: vec![100.5],
        });
        let err = Baseline::derive(&inputs, &KernelConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no matching OHLC bar"), "{}", err);
    }
}
