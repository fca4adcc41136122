//! Per-cell execution: recover durable state, produce the missing
//! permutations in chunks, and finalize with a summary.
//!
//! State machine: Fresh -> Resuming -> Producing -> Finalizing ->
//! Complete. Only the metrics log decides where to resume; progress.json
//! is an advisory snapshot regenerated at every checkpoint.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::baseline::Baseline;
use crate::config::RunConfig;
use crate::grid::{Cell, CellParams};
use crate::inputs::Inputs;
use crate::kernel::Kernel;
use crate::metrics::{CellSummary, MetricsRow};
use crate::persist::{append_log_line, atomic_write_json, MetricsLog};
use crate::seeding;

/// Advisory progress snapshot. Written atomically at every checkpoint,
/// never consulted for resume decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub cell_id: String,
    pub state: String,
    pub n_done: u64,
    pub n_target: u32,
    pub params: CellParams,
    pub updated_at: String,
}

/// Context the finalizer needs beyond the cell itself.
#[derive(Debug, Clone, Copy)]
pub struct SummaryCtx {
    pub baseline_pf: f64,
    /// Bonferroni denominator: the filtered grid size.
    pub n_cells: usize,
    pub min_trades: u32,
}

/// How a cell invocation ended. An interrupted cell has a durable
/// checkpoint on disk and re-enters Resuming on the next invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOutcome {
    Complete,
    Interrupted,
}

pub struct CellPaths {
    pub dir: PathBuf,
    pub metrics: PathBuf,
    pub progress: PathBuf,
    pub summary: PathBuf,
    pub logs: PathBuf,
}

impl CellPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            metrics: dir.join("metrics_compact.csv"),
            progress: dir.join("progress.json"),
            summary: dir.join("summary.json"),
            logs: dir.join("logs.txt"),
            dir,
        }
    }
}

/// Parse `summary.json` if present and well-formed.
pub fn read_summary(path: &Path) -> Option<CellSummary> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// A cell is complete iff its summary is present and valid *and* the
/// metrics log really holds the target row count. The summary alone is
/// never trusted; it is a cache of the log.
pub fn cell_is_complete(dir: &Path, n_target: u32) -> bool {
    let paths = CellPaths::new(dir.to_path_buf());
    let Some(summary) = read_summary(&paths.summary) else {
        return false;
    };
    if summary.integrity.n_rows_deduped != n_target as u64 {
        return false;
    }
    let log = MetricsLog::new(paths.metrics);
    if !log.exists() {
        return false;
    }
    matches!(log.count_rows(), Ok(count) if count == n_target as u64)
}

fn write_progress(paths: &CellPaths, cell: &Cell, state: &str, n_done: u64, n_target: u32) {
    let snapshot = ProgressSnapshot {
        cell_id: cell.id.clone(),
        state: state.to_string(),
        n_done,
        n_target,
        params: cell.params,
        updated_at: Utc::now().to_rfc3339(),
    };
    // Advisory: losing a progress write never loses data.
    if let Err(err) = atomic_write_json(&paths.progress, &snapshot) {
        warn!("cell {}: progress write failed: {:#}", cell.id, err);
    }
}

fn log_event(paths: &CellPaths, msg: &str) {
    append_log_line(&paths.logs, &format!("{} {}", Utc::now().to_rfc3339(), msg));
}

/// Run one cell to completion (or return early if already complete).
///
/// A shutdown signal is honored at chunk boundaries: the in-flight chunk
/// is appended and `progress.json` rewritten before the function returns
/// `Interrupted`, so the checkpoint on disk is always consistent.
pub fn run_cell(
    cfg: &RunConfig,
    inputs: &Inputs,
    base: &Baseline,
    cell: &Cell,
    ctx: &SummaryCtx,
) -> Result<CellOutcome> {
    let paths = CellPaths::new(cfg.cell_dir(&cell.id));
    let n_target = cfg.n_per_cell;

    if cell_is_complete(&paths.dir, n_target) {
        debug!("cell {}: already complete, skipping", cell.id);
        return Ok(CellOutcome::Complete);
    }

    std::fs::create_dir_all(&paths.dir)
        .with_context(|| format!("Failed to create cell directory: {:?}", paths.dir))?;

    let log = MetricsLog::new(paths.metrics.clone());
    let fresh = !log.exists();
    log.create()?;

    let recovery = log.recover(n_target)?;
    let session_start = recovery.integrity;
    let mut n_unique = recovery.integrity.n_rows_deduped;
    let mut next_idx = recovery.start_idx;

    if fresh {
        info!("cell {}: fresh start, target {}", cell.id, n_target);
        log_event(&paths, &format!("fresh target={}", n_target));
    } else {
        info!(
            "cell {}: resuming at {} ({} rows, {} duplicates dropped)",
            cell.id, next_idx, n_unique, recovery.integrity.n_duplicates_dropped
        );
        log_event(
            &paths,
            &format!(
                "resume start_idx={} n_done={} dropped={} rewritten={}",
                next_idx, n_unique, recovery.integrity.n_duplicates_dropped, recovery.rewritten
            ),
        );
    }
    write_progress(&paths, cell, "producing", n_unique, n_target);

    let bseed = seeding::base_seed(cfg.global_seed, &cell.id);
    let mut kernel = Kernel::new(inputs, base, &cfg.kernel, cell.params);
    let mut chunk: Vec<MetricsRow> = Vec::with_capacity(cfg.checkpoint_every as usize);

    while n_unique < n_target as u64 {
        if crate::shutdown::requested() {
            log_event(&paths, &format!("shutdown signal; checkpointed at {} rows", n_unique));
            info!(
                "cell {}: shutdown signal, exiting with durable checkpoint at {}/{}",
                cell.id, n_unique, n_target
            );
            return Ok(CellOutcome::Interrupted);
        }

        let remaining = n_target as u64 - n_unique;
        let chunk_len = (cfg.checkpoint_every as u64).min(remaining) as u32;

        chunk.clear();
        for perm_index in next_idx..next_idx + chunk_len {
            let mut rng = seeding::sim_rng(bseed, perm_index);
            chunk.push(kernel.simulate(perm_index, &mut rng));
        }

        if let Err(err) = log.append_chunk(&chunk) {
            write_progress(&paths, cell, "stalled", n_unique, n_target);
            log_event(&paths, &format!("stalled: {:#}", err));
            return Err(err.context(format!("cell {} stalled", cell.id)));
        }

        // Every produced index is above the recovered max, so each chunk
        // adds exactly chunk_len unique rows.
        n_unique += chunk_len as u64;
        next_idx += chunk_len;
        write_progress(&paths, cell, "producing", n_unique, n_target);
        debug!("cell {}: {}/{}", cell.id, n_unique, n_target);
    }

    log_event(
        &paths,
        &format!(
            "produced degenerate={} pf_sentinel={} anomalies={}",
            kernel.counters.degenerate, kernel.counters.pf_sentinel, kernel.counters.anomalies
        ),
    );

    let produced = n_unique - session_start.n_rows_deduped;
    finalize(cfg, cell, &paths, &log, ctx, session_start, produced)?;
    Ok(CellOutcome::Complete)
}

/// Recompute the summary from the (re-deduped) log and write it
/// atomically. Fails, leaving the cell incomplete, if the log does not
/// hold exactly the target row count.
///
/// Integrity accounting spans the whole session: raw rows and dropped
/// duplicates seen at resume plus anything the final dedupe pass found.
fn finalize(
    cfg: &RunConfig,
    cell: &Cell,
    paths: &CellPaths,
    log: &MetricsLog,
    ctx: &SummaryCtx,
    session_start: crate::metrics::Integrity,
    produced: u64,
) -> Result<()> {
    let n_target = cfg.n_per_cell;
    write_progress(paths, cell, "finalizing", n_target as u64, n_target);

    let recovery = log.recover(n_target)?;
    if recovery.integrity.n_rows_deduped != n_target as u64 {
        log_event(
            paths,
            &format!(
                "finalize integrity violation: {} unique rows, want {}",
                recovery.integrity.n_rows_deduped, n_target
            ),
        );
        bail!(
            "cell {}: finalize found {} unique rows, want {}",
            cell.id,
            recovery.integrity.n_rows_deduped,
            n_target
        );
    }

    let integrity = crate::metrics::Integrity {
        n_rows_raw: session_start.n_rows_raw + produced,
        n_duplicates_dropped: session_start.n_duplicates_dropped
            + recovery.integrity.n_duplicates_dropped,
        n_rows_deduped: recovery.integrity.n_rows_deduped,
    };

    let summary = CellSummary::compute(
        &cell.id,
        cell.params,
        n_target,
        &recovery.rows,
        integrity,
        ctx.min_trades,
        ctx.baseline_pf,
        ctx.n_cells,
        Utc::now().to_rfc3339(),
    );
    atomic_write_json(&paths.summary, &summary)?;

    write_progress(paths, cell, "complete", n_target as u64, n_target);
    log_event(paths, "complete");
    info!(
        "cell {}: complete (pf p50 {:.3}, robust {:.3})",
        cell.id, summary.profit_factor.p50, summary.robust_score
    );
    Ok(())
}

/// Orphan-sweep entry: regenerate a missing or invalid summary for a
/// cell whose metrics log is already full. Returns true when a summary
/// was (re)written.
pub fn refinalize_from_log(cfg: &RunConfig, cell: &Cell, ctx: &SummaryCtx) -> Result<bool> {
    let paths = CellPaths::new(cfg.cell_dir(&cell.id));
    let n_target = cfg.n_per_cell;

    if cell_is_complete(&paths.dir, n_target) {
        return Ok(false);
    }
    let log = MetricsLog::new(paths.metrics.clone());
    if !log.exists() {
        return Ok(false);
    }
    let recovery = log.recover(n_target)?;
    if recovery.integrity.n_rows_deduped != n_target as u64 {
        return Ok(false);
    }

    let summary = CellSummary::compute(
        &cell.id,
        cell.params,
        n_target,
        &recovery.rows,
        recovery.integrity,
        ctx.min_trades,
        ctx.baseline_pf,
        ctx.n_cells,
        Utc::now().to_rfc3339(),
    );
    atomic_write_json(&paths.summary, &summary)?;
    write_progress(&paths, cell, "complete", n_target as u64, n_target);
    log_event(&paths, "summary regenerated from metrics log");
    info!("cell {}: orphan summary regenerated", cell.id);
    Ok(true)
}
