//! Input loaders: trade list, equity curve, optional OHLC bars, and the
//! optional baseline report. Everything is held in flat columnar form so
//! the kernel operates on primitive slices.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

use crate::config::RunConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

/// Columnar trade list, ordered by entry time. Never mutated after load.
#[derive(Debug, Clone, Default)]
pub struct TradeList {
    pub entry_time: Vec<DateTime<Utc>>,
    pub exit_time: Vec<DateTime<Utc>>,
    pub entry_price: Vec<f64>,
    pub exit_price: Vec<f64>,
    pub qty: Vec<f64>,
    pub side: Vec<Side>,
    pub pnl: Vec<f64>,
    /// Present only when the input carried a `risk_dollars` column.
    pub risk_dollars: Option<Vec<f64>>,
}

impl TradeList {
    pub fn len(&self) -> usize {
        self.pnl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pnl.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EquityCurve {
    pub time: Vec<DateTime<Utc>>,
    pub equity: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct OhlcSeries {
    pub time: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
}

impl OhlcSeries {
    pub fn len(&self) -> usize {
        self.time.len()
    }
}

/// Everything the engine reads. Loaded once per process and shared
/// read-only by every cell.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub trades: TradeList,
    pub equity: EquityCurve,
    pub ohlc: Option<OhlcSeries>,
    /// Baseline profit factor parsed from `step1_report.txt`, if present.
    pub report_pf: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    entry_time: String,
    exit_time: String,
    entry_price: f64,
    exit_price: f64,
    pnl: f64,
    qty: f64,
    side: String,
    #[serde(default)]
    risk_dollars: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EquityRow {
    time: String,
    equity: f64,
}

#[derive(Debug, Deserialize)]
struct OhlcRow {
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp: {}", raw))
}

pub fn load_trades(path: &Path) -> Result<TradeList> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open trade list: {:?}", path))?;

    let mut trades = TradeList::default();
    let mut risk: Vec<f64> = Vec::new();
    let mut saw_risk = false;

    for (i, result) in reader.deserialize().enumerate() {
        let line = i + 2; // header is line 1
        let row: TradeRow = result
            .with_context(|| format!("Bad trade row at {:?}:{}", path, line))?;

        let entry_time = parse_ts(&row.entry_time)
            .with_context(|| format!("Bad entry_time at {:?}:{}", path, line))?;
        let exit_time = parse_ts(&row.exit_time)
            .with_context(|| format!("Bad exit_time at {:?}:{}", path, line))?;
        if exit_time < entry_time {
            bail!("exit_time precedes entry_time at {:?}:{}", path, line);
        }
        if let Some(prev) = trades.entry_time.last() {
            if entry_time < *prev {
                bail!("Trades out of entry_time order at {:?}:{}", path, line);
            }
        }

        let side = match row.side.to_ascii_lowercase().as_str() {
            "long" | "buy" => Side::Long,
            "short" | "sell" => Side::Short,
            other => bail!("Unknown side {:?} at {:?}:{}", other, path, line),
        };

        if !row.pnl.is_finite() || !row.entry_price.is_finite() || !row.exit_price.is_finite() {
            bail!("Non-finite trade values at {:?}:{}", path, line);
        }

        trades.entry_time.push(entry_time);
        trades.exit_time.push(exit_time);
        trades.entry_price.push(row.entry_price);
        trades.exit_price.push(row.exit_price);
        trades.qty.push(row.qty);
        trades.side.push(side);
        trades.pnl.push(row.pnl);

        if let Some(r) = row.risk_dollars {
            saw_risk = true;
            risk.push(r);
        } else {
            risk.push(f64::NAN);
        }
    }

    if trades.is_empty() {
        bail!("Trade list is empty: {:?}", path);
    }
    if saw_risk {
        if risk.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            bail!("risk_dollars column has missing or non-positive entries: {:?}", path);
        }
        trades.risk_dollars = Some(risk);
    }

    Ok(trades)
}

pub fn load_equity(path: &Path) -> Result<EquityCurve> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open equity curve: {:?}", path))?;

    let mut curve = EquityCurve::default();
    for (i, result) in reader.deserialize().enumerate() {
        let line = i + 2;
        let row: EquityRow = result
            .with_context(|| format!("Bad equity row at {:?}:{}", path, line))?;
        let time = parse_ts(&row.time)
            .with_context(|| format!("Bad time at {:?}:{}", path, line))?;
        if let Some(prev) = curve.time.last() {
            if time <= *prev {
                bail!("Equity curve time not increasing at {:?}:{}", path, line);
            }
        }
        if !row.equity.is_finite() || row.equity <= 0.0 {
            bail!("Non-positive equity at {:?}:{}", path, line);
        }
        curve.time.push(time);
        curve.equity.push(row.equity);
    }

    if curve.time.is_empty() {
        bail!("Equity curve is empty: {:?}", path);
    }
    Ok(curve)
}

pub fn load_ohlc(path: &Path) -> Result<OhlcSeries> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open OHLC series: {:?}", path))?;

    let mut bars = OhlcSeries::default();
    for (i, result) in reader.deserialize().enumerate() {
        let line = i + 2;
        let row: OhlcRow = result
            .with_context(|| format!("Bad OHLC row at {:?}:{}", path, line))?;
        let time = parse_ts(&row.time)
            .with_context(|| format!("Bad time at {:?}:{}", path, line))?;
        if let Some(prev) = bars.time.last() {
            if time <= *prev {
                bail!("OHLC time not increasing at {:?}:{}", path, line);
            }
        }
        bars.time.push(time);
        bars.open.push(row.open);
        bars.high.push(row.high);
        bars.low.push(row.low);
        bars.close.push(row.close);
    }

    if bars.time.is_empty() {
        bail!("OHLC series is empty: {:?}", path);
    }
    Ok(bars)
}

/// Lenient scan of the step-1 backtest report for a baseline profit
/// factor. Missing file or missing field is fine; the caller falls back
/// to the unperturbed trade list.
pub fn parse_report_pf(path: &Path) -> Option<f64> {
    let text = std::fs::read_to_string(path).ok()?;
    for line in text.lines() {
        let lower = line.to_ascii_lowercase();
        if !lower.contains("profit factor") {
            continue;
        }
        // Take the last parseable number on the line.
        let value = line
            .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .filter(|tok| !tok.is_empty())
            .filter_map(|tok| tok.parse::<f64>().ok())
            .last();
        if let Some(v) = value {
            if v.is_finite() {
                return Some(v);
            }
        }
    }
    None
}

/// Load and validate everything the run needs.
pub fn load_inputs(cfg: &RunConfig) -> Result<Inputs> {
    let trades_path = cfg
        .input_path("trade_list.csv")
        .with_context(|| format!("trade_list.csv not found under {:?}", cfg.repo_path))?;
    let equity_path = cfg
        .input_path("equity_curve.csv")
        .with_context(|| format!("equity_curve.csv not found under {:?}", cfg.repo_path))?;

    let trades = load_trades(&trades_path)?;
    let equity = load_equity(&equity_path)?;

    let ohlc = match cfg.input_path("ohlc.csv") {
        Some(path) => Some(load_ohlc(&path)?),
        None => None,
    };

    let report_pf = cfg
        .input_path("step1_report.txt")
        .and_then(|p| parse_report_pf(&p));

    tracing::info!(
        trades = trades.len(),
        equity_points = equity.time.len(),
        ohlc_bars = ohlc.as_ref().map(|b| b.len()).unwrap_or(0),
        report_pf = ?report_pf,
        "Inputs loaded"
    );

    Ok(Inputs {
        trades,
        equity,
        ohlc,
        report_pf,
    })
}
