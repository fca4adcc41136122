//! Grid execution: enumerate cells, fan them out to a bounded pool of
//! worker processes, keep the aggregated artifacts fresh, and sweep up
//! orphaned cells at the end.
//!
//! Workers are processes, not threads: a panic or numeric blow-up inside
//! one cell cannot take the coordinator down, and a hung cell is just a
//! released slot. The coordinator owns `aggregated/` exclusively and
//! never writes under `per_cell/`.

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::baseline::Baseline;
use crate::config::RunConfig;
use crate::grid::{BootstrapMode, Cell, GridSpec, ShuffleMode};
use crate::inputs::{load_inputs, Inputs};
use crate::kernel::baseline_row;
use crate::persist::{append_log_line, atomic_write_json, atomic_write_str};
use crate::runner::{
    cell_is_complete, read_summary, refinalize_from_log, run_cell, CellOutcome, CellPaths,
    SummaryCtx,
};

const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);
const PROGRESS_EVERY: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Everything a worker process needs to reproduce the coordinator's view
/// of the run. Written atomically before any cell is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub config: RunConfig,
    pub grid: GridSpec,
    pub seed_scheme: SeedScheme,
    pub n_cells: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedScheme {
    pub global_seed: u32,
    pub seed_stride: u32,
    pub perm_prime: u32,
    pub hash: String,
    pub rng: String,
}

impl SeedScheme {
    fn current(global_seed: u32) -> Self {
        Self {
            global_seed,
            seed_stride: crate::seeding::SEED_STRIDE,
            perm_prime: crate::seeding::PERM_PRIME,
            hash: "sha256/first4be".to_string(),
            rng: "chacha8".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Heartbeat {
    updated_at: String,
    n_cells: usize,
    n_complete: usize,
    n_running: usize,
    n_pending: usize,
}

struct RunningCell {
    cell: Cell,
    child: Child,
    started: Instant,
}

/// Outcome of one coordinator invocation.
#[derive(Debug, Clone, Copy)]
pub struct GridOutcome {
    pub n_cells: usize,
    pub n_complete: usize,
    pub all_done: bool,
}

/// Resolve the baseline profit factor for p-values: the step-1 report
/// when available, otherwise the unperturbed trade list.
pub fn resolve_summary_ctx(
    cfg: &RunConfig,
    inputs: &Inputs,
    base: &Baseline,
    n_cells: usize,
) -> SummaryCtx {
    let baseline_pf = inputs
        .report_pf
        .unwrap_or_else(|| baseline_row(inputs, base, &cfg.kernel).profit_factor);
    SummaryCtx {
        baseline_pf,
        n_cells,
        min_trades: cfg.kernel.min_trades,
    }
}

/// Coordinator entry point for `run`.
pub fn run_grid(cfg: &RunConfig) -> Result<GridOutcome> {
    let inputs = load_inputs(cfg)?;
    let base = Baseline::derive(&inputs, &cfg.kernel)?;

    let grid = GridSpec::default();
    let cells = grid.enumerate(cfg);
    let ctx = resolve_summary_ctx(cfg, &inputs, &base, cells.len());

    if cfg.status_only {
        print_status(cfg, &cells);
        return Ok(scan_outcome(cfg, &cells));
    }

    let aggregated = cfg.aggregated_dir();
    std::fs::create_dir_all(&aggregated)
        .with_context(|| format!("Failed to create {:?}", aggregated))?;
    std::fs::create_dir_all(cfg.run_dir().join("per_cell"))?;

    let manifest = RunManifest {
        config: cfg.clone(),
        grid: grid.clone(),
        seed_scheme: SeedScheme::current(cfg.global_seed),
        n_cells: cells.len(),
        created_at: Utc::now().to_rfc3339(),
    };
    atomic_write_json(&cfg.manifest_path(), &manifest)?;

    info!(
        "run {}: {} cells, {} permutations each, {} workers",
        cfg.run_name,
        cells.len(),
        cfg.n_per_cell,
        cfg.jobs.max(1)
    );

    let interrupted = dispatch_cells(cfg, &cells)?;
    if interrupted {
        let outcome = scan_outcome(cfg, &cells);
        write_heartbeat(cfg, cells.len(), outcome.n_complete, 0, cells.len() - outcome.n_complete);
        info!(
            "run {}: interrupted at {}/{} cells; re-run with the same run_name to resume",
            cfg.run_name, outcome.n_complete, outcome.n_cells
        );
        return Ok(outcome);
    }

    // Orphan sweep: any cell with a full metrics log but no valid
    // summary (worker died between production and finalize) is
    // re-finalized from the log alone.
    let swept: usize = cells
        .par_iter()
        .map(|cell| match refinalize_from_log(cfg, cell, &ctx) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(err) => {
                warn!("cell {}: orphan sweep failed: {:#}", cell.id, err);
                0
            }
        })
        .sum();
    if swept > 0 {
        info!("orphan sweep regenerated {} summaries", swept);
    }

    let outcome = scan_outcome(cfg, &cells);
    write_grid_summary(cfg, &cells)?;

    if outcome.all_done {
        atomic_write_str(
            &aggregated.join("DONE.txt"),
            &format!("{} cells complete at {}\n", outcome.n_cells, Utc::now().to_rfc3339()),
        )?;
        info!("run {}: DONE", cfg.run_name);
    } else {
        info!(
            "run {}: {}/{} cells complete; re-run to continue",
            cfg.run_name, outcome.n_complete, outcome.n_cells
        );
    }

    write_heartbeat(cfg, cells.len(), outcome.n_complete, 0, cells.len() - outcome.n_complete);
    Ok(outcome)
}

/// Forward the shutdown to a worker. SIGTERM, not a hard kill: the
/// worker finishes its current chunk append and rewrites its progress
/// snapshot before exiting.
#[cfg(unix)]
fn terminate_child(child: &Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_child(_child: &Child) {}

/// The primary dispatch loop: a bounded pool of worker processes, one
/// cell each, with a per-cell timeout that releases the slot without
/// killing the worker. Returns true when a shutdown signal cut the pass
/// short; the queue is dropped and running workers are signaled and
/// drained.
fn dispatch_cells(cfg: &RunConfig, cells: &[Cell]) -> Result<bool> {
    let n_target = cfg.n_per_cell;
    let mut queue: VecDeque<Cell> = cells
        .par_iter()
        .filter(|c| !cell_is_complete(&cfg.cell_dir(&c.id), n_target))
        .cloned()
        .collect::<Vec<_>>()
        .into();

    let n_already = cells.len() - queue.len();
    if n_already > 0 {
        info!("{} cells already complete, skipping", n_already);
    }

    let exe = std::env::current_exe().context("Failed to resolve current executable")?;
    let manifest_path = cfg.manifest_path();
    let timeout = cfg.cell_timeout();
    let jobs = cfg.jobs.max(1);

    let mut running: Vec<RunningCell> = Vec::with_capacity(jobs);
    let mut detached: Vec<Child> = Vec::new();
    let mut n_complete = n_already;
    let mut n_failed = 0usize;
    let mut interrupted = false;

    let started = Instant::now();
    write_heartbeat(cfg, cells.len(), n_complete, 0, queue.len());
    append_progress_line(cfg, n_complete, 0, queue.len());
    let mut last_heartbeat = Instant::now();
    let mut last_progress = Instant::now();

    while !queue.is_empty() || !running.is_empty() {
        if !interrupted && crate::shutdown::requested() {
            interrupted = true;
            info!(
                "shutdown signal: dropping {} queued cells, signaling {} workers",
                queue.len(),
                running.len()
            );
            queue.clear();
            for slot in &running {
                terminate_child(&slot.child);
            }
        }

        while !interrupted && running.len() < jobs {
            let Some(cell) = queue.pop_front() else { break };
            let child = Command::new(&exe)
                .arg("cell")
                .arg("--manifest")
                .arg(&manifest_path)
                .arg("--cell-id")
                .arg(&cell.id)
                .stdin(Stdio::null())
                .spawn()
                .with_context(|| format!("Failed to spawn worker for cell {}", cell.id))?;
            info!("cell {}: worker {} started", cell.id, child.id());
            running.push(RunningCell {
                cell,
                child,
                started: Instant::now(),
            });
        }

        let mut i = 0;
        while i < running.len() {
            let waited = running[i].child.try_wait();
            let timed_out = running[i].started.elapsed() > timeout;
            match waited {
                Ok(Some(status)) => {
                    let slot = running.swap_remove(i);
                    if status.success() {
                        n_complete += 1;
                        info!(
                            "cell {}: complete ({}/{})",
                            slot.cell.id,
                            n_complete,
                            cells.len()
                        );
                    } else if interrupted {
                        info!("cell {}: worker checkpointed and exited", slot.cell.id);
                    } else {
                        n_failed += 1;
                        warn!(
                            "cell {}: worker exited with {}; cell will be retried next pass",
                            slot.cell.id, status
                        );
                    }
                }
                Ok(None) if timed_out => {
                    let slot = running.swap_remove(i);
                    warn!(
                        "cell {}: worker timed out after {:?}; slot released, state on disk is authoritative",
                        slot.cell.id, timeout
                    );
                    detached.push(slot.child);
                }
                Ok(None) => i += 1,
                Err(err) => {
                    let slot = running.swap_remove(i);
                    warn!("cell {}: wait failed: {}", slot.cell.id, err);
                    detached.push(slot.child);
                }
            }
        }

        // Reap any released workers that have since exited.
        detached.retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));

        if last_heartbeat.elapsed() >= HEARTBEAT_EVERY {
            write_heartbeat(cfg, cells.len(), n_complete, running.len(), queue.len());
            last_heartbeat = Instant::now();
        }
        if last_progress.elapsed() >= PROGRESS_EVERY {
            append_progress_line(cfg, n_complete, running.len(), queue.len());
            last_progress = Instant::now();
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    info!(
        "dispatch finished in {:.0}s: {} complete, {} failed/timed out, {} workers still detached",
        started.elapsed().as_secs_f64(),
        n_complete,
        n_failed,
        detached.len()
    );
    Ok(interrupted)
}

fn write_heartbeat(cfg: &RunConfig, n_cells: usize, n_complete: usize, n_running: usize, n_pending: usize) {
    let hb = Heartbeat {
        updated_at: Utc::now().to_rfc3339(),
        n_cells,
        n_complete,
        n_running,
        n_pending,
    };
    if let Err(err) = atomic_write_json(&cfg.aggregated_dir().join("heartbeat.json"), &hb) {
        warn!("heartbeat write failed: {:#}", err);
    }
}

fn append_progress_line(cfg: &RunConfig, n_complete: usize, n_running: usize, n_pending: usize) {
    let path = cfg.aggregated_dir().join("progress.csv");
    if !path.exists() {
        append_log_line(&path, "time,complete,running,pending");
    }
    append_log_line(
        &path,
        &format!("{},{},{},{}", Utc::now().to_rfc3339(), n_complete, n_running, n_pending),
    );
}

fn scan_outcome(cfg: &RunConfig, cells: &[Cell]) -> GridOutcome {
    let n_complete = cells
        .par_iter()
        .filter(|c| cell_is_complete(&cfg.cell_dir(&c.id), cfg.n_per_cell))
        .count();
    GridOutcome {
        n_cells: cells.len(),
        n_complete,
        all_done: n_complete == cells.len(),
    }
}

fn shuffle_label(mode: ShuffleMode) -> &'static str {
    match mode {
        ShuffleMode::None => "none",
        ShuffleMode::Permute => "permute",
        ShuffleMode::BlockPermute => "block_permute",
    }
}

fn bootstrap_label(mode: BootstrapMode) -> &'static str {
    match mode {
        BootstrapMode::None => "none",
        BootstrapMode::TradeBootstrap => "trade_bootstrap",
        BootstrapMode::BlockBootstrap => "block_bootstrap",
    }
}

/// One row per completed cell; incomplete cells are simply absent.
fn write_grid_summary(cfg: &RunConfig, cells: &[Cell]) -> Result<()> {
    let path = cfg.aggregated_dir().join("grid_summary.csv");
    let mut buf = String::new();
    buf.push_str(
        "cell_id,p_skip,slip_dollars_max,delay_bars_max,shuffle_mode,bootstrap_mode,block_len,\
         total_return_p05,total_return_p50,total_return_p95,\
         max_drawdown_p50,max_drawdown_p95,\
         profit_factor_p05,profit_factor_p50,profit_factor_p95,\
         worst_month_p05,p_raw,p_corrected,robust_score,\
         n_rows_raw,n_duplicates_dropped,n_rows_deduped\n",
    );

    let mut n_rows = 0usize;
    for cell in cells {
        let paths = CellPaths::new(cfg.cell_dir(&cell.id));
        if !cell_is_complete(&paths.dir, cfg.n_per_cell) {
            continue;
        }
        let Some(s) = read_summary(&paths.summary) else { continue };
        let p = &s.params;
        writeln!(
            buf,
            "{},{},{},{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6e},{:.6e},{:.6},{},{},{}",
            s.cell_id,
            p.p_skip,
            p.slip_dollars_max,
            p.delay_bars_max,
            shuffle_label(p.shuffle_mode),
            bootstrap_label(p.bootstrap_mode),
            if p.uses_blocks() { p.block_len } else { 0 },
            s.total_return_pct.p05,
            s.total_return_pct.p50,
            s.total_return_pct.p95,
            s.max_drawdown_pct.p50,
            s.max_drawdown_pct.p95,
            s.profit_factor.p05,
            s.profit_factor.p50,
            s.profit_factor.p95,
            s.worst_month_pct.p05,
            s.p_raw,
            s.p_corrected,
            s.robust_score,
            s.integrity.n_rows_raw,
            s.integrity.n_duplicates_dropped,
            s.integrity.n_rows_deduped,
        )
        .expect("writing to string cannot fail");
        n_rows += 1;
    }

    crate::persist::atomic_write_bytes(&path, buf.as_bytes())?;
    info!("grid_summary.csv: {} rows", n_rows);
    Ok(())
}

/// `status` subcommand: one line per cell, derived from the authoritative
/// files only.
pub fn print_status(cfg: &RunConfig, cells: &[Cell]) {
    let n_target = cfg.n_per_cell;
    let statuses: Vec<(String, String)> = cells
        .par_iter()
        .map(|cell| {
            let paths = CellPaths::new(cfg.cell_dir(&cell.id));
            let state = if cell_is_complete(&paths.dir, n_target) {
                "complete".to_string()
            } else if paths.metrics.exists() {
                let log = crate::persist::MetricsLog::new(paths.metrics.clone());
                match log.count_rows() {
                    Ok(n) => format!("producing {}/{}", n, n_target),
                    Err(_) => "unreadable".to_string(),
                }
            } else {
                "pending".to_string()
            };
            (cell.id.clone(), state)
        })
        .collect();

    let n_complete = statuses.iter().filter(|(_, s)| s == "complete").count();
    println!("run {}: {}/{} cells complete", cfg.run_name, n_complete, cells.len());
    for (id, state) in statuses {
        println!("  {:<14} {}", id, state);
    }
}

/// Worker-process entry: resolve the cell from the manifest and run it.
pub fn run_worker(manifest_path: &Path, cell_id: &str) -> Result<CellOutcome> {
    let manifest = crate::config::load_manifest(manifest_path)?;
    let cfg = manifest.config;

    let inputs = load_inputs(&cfg)?;
    let base = Baseline::derive(&inputs, &cfg.kernel)?;
    let cells = manifest.grid.enumerate(&cfg);
    let cell = cells
        .iter()
        .find(|c| c.id == cell_id)
        .with_context(|| format!("Cell {} is not in the manifest grid", cell_id))?;

    let ctx = resolve_summary_ctx(&cfg, &inputs, &base, manifest.n_cells);
    run_cell(&cfg, &inputs, &base, cell, &ctx)
}
