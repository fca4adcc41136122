//! End-to-end scenarios against real files: baseline identity,
//! deterministic reproduction, crash-safe resume, and dedupe under
//! corruption.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use stressgrid::baseline::Baseline;
use stressgrid::config::RunConfig;
use stressgrid::grid::{cell_id, BootstrapMode, Cell, CellKey, CellParams, ShuffleMode};
use stressgrid::inputs::load_inputs;
use stressgrid::metrics::{MetricsRow, PF_SENTINEL};
use stressgrid::persist::MetricsLog;
use stressgrid::runner::{cell_is_complete, read_summary, run_cell, SummaryCtx};

/// Write a 100-trade fixture (every trade +10 dollars) plus a matching
/// equity curve into `repo`.
fn write_uniform_fixture(repo: &Path, n_trades: usize, pnl: f64) {
    let mut trades = String::from("entry_time,exit_time,entry_price,exit_price,pnl,qty,side\n");
    for i in 0..n_trades {
        let month = 1 + (i / 25) as u32;
        let day = 1 + (i % 25) as u32;
        trades.push_str(&format!(
            "2024-{m:02}-{d:02}T10:00:00Z,2024-{m:02}-{d:02}T12:00:00Z,100.0,{exit},{pnl},1,long\n",
            m = month,
            d = day,
            exit = 100.0 + pnl,
            pnl = pnl,
        ));
    }
    std::fs::write(repo.join("trade_list.csv"), trades).unwrap();

    let equity = "time,equity\n\
                  2024-01-01T00:00:00Z,10000\n\
                  2024-03-01T00:00:00Z,10500\n\
                  2024-06-01T00:00:00Z,11000\n";
    std::fs::write(repo.join("equity_curve.csv"), equity).unwrap();
}

fn cell_with(params: CellParams) -> Cell {
    let key = CellKey {
        p_skip_idx: 0,
        slip_idx: 0,
        delay_idx: 0,
        shuffle_idx: 0,
        bootstrap_idx: 0,
        block_len_idx: 0,
    };
    Cell {
        id: cell_id(&key, &params),
        key,
        params,
    }
}

fn zero_params() -> CellParams {
    CellParams {
        p_skip: 0.0,
        slip_dollars_max: 0.0,
        delay_bars_max: 0,
        shuffle_mode: ShuffleMode::None,
        bootstrap_mode: BootstrapMode::None,
        block_len: 5,
    }
}

fn run_fixture_cell(repo: &Path, n_per_cell: u32, params: CellParams, seed: u32) -> (RunConfig, Cell) {
    let mut cfg = RunConfig::new(repo.to_path_buf(), "e2e".to_string());
    cfg.n_per_cell = n_per_cell;
    cfg.checkpoint_every = 50;
    cfg.global_seed = seed;

    let inputs = load_inputs(&cfg).unwrap();
    let base = Baseline::derive(&inputs, &cfg.kernel).unwrap();
    let cell = cell_with(params);
    let ctx = SummaryCtx {
        baseline_pf: 1.5,
        n_cells: 1,
        min_trades: cfg.kernel.min_trades,
    };
    run_cell(&cfg, &inputs, &base, &cell, &ctx).unwrap();
    (cfg, cell)
}

#[test]
fn baseline_identity_cell_reports_exact_metrics() {
    let repo = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo.path(), 100, 10.0);

    let (cfg, cell) = run_fixture_cell(repo.path(), 1000, zero_params(), 1337);

    let log = MetricsLog::new(cfg.cell_dir(&cell.id).join("metrics_compact.csv"));
    let rec = log.recover(1000).unwrap();
    assert_eq!(rec.rows.len(), 1000);
    for row in &rec.rows {
        assert!((row.total_return_pct - 0.10).abs() < 1e-9);
        assert_eq!(row.max_drawdown_pct, 0.0);
        assert_eq!(row.profit_factor, PF_SENTINEL);
        assert_eq!(row.trades_executed, 100);
    }

    let summary = read_summary(&cfg.cell_dir(&cell.id).join("summary.json")).unwrap();
    assert!((summary.total_return_pct.p50 - 0.10).abs() < 1e-9);
    assert_eq!(summary.n_pf_sentinel, 1000);
}

#[test]
fn perturbed_runs_reproduce_byte_identically() {
    let params = CellParams {
        p_skip: 0.05,
        slip_dollars_max: 50.0,
        ..zero_params()
    };

    let repo_a = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo_a.path(), 100, 10.0);
    let (cfg_a, cell_a) = run_fixture_cell(repo_a.path(), 200, params, 1337);

    let repo_b = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo_b.path(), 100, 10.0);
    let (cfg_b, cell_b) = run_fixture_cell(repo_b.path(), 200, params, 1337);

    let a = std::fs::read(cfg_a.cell_dir(&cell_a.id).join("metrics_compact.csv")).unwrap();
    let b = std::fs::read(cfg_b.cell_dir(&cell_b.id).join("metrics_compact.csv")).unwrap();
    assert_eq!(a, b, "identical seeds produced different metrics files");
}

#[test]
fn interrupted_cell_resumes_to_the_clean_result() {
    let params = CellParams {
        p_skip: 0.05,
        slip_dollars_max: 50.0,
        ..zero_params()
    };

    // Clean reference run.
    let repo_clean = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo_clean.path(), 100, 10.0);
    let (cfg_clean, cell) = run_fixture_cell(repo_clean.path(), 200, params, 1337);
    let clean =
        std::fs::read_to_string(cfg_clean.cell_dir(&cell.id).join("metrics_compact.csv")).unwrap();

    // Interrupted run: same inputs, killed after 137 rows.
    let repo = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo.path(), 100, 10.0);
    let (cfg, cell) = run_fixture_cell(repo.path(), 200, params, 1337);
    let metrics_path = cfg.cell_dir(&cell.id).join("metrics_compact.csv");
    let summary_path = cfg.cell_dir(&cell.id).join("summary.json");

    let full = std::fs::read_to_string(&metrics_path).unwrap();
    let truncated: String = full.lines().take(1 + 137).map(|l| format!("{}\n", l)).collect();
    std::fs::write(&metrics_path, truncated).unwrap();
    std::fs::remove_file(&summary_path).unwrap();

    let inputs = load_inputs(&cfg).unwrap();
    let base = Baseline::derive(&inputs, &cfg.kernel).unwrap();
    let ctx = SummaryCtx {
        baseline_pf: 1.5,
        n_cells: 1,
        min_trades: cfg.kernel.min_trades,
    };
    run_cell(&cfg, &inputs, &base, &cell, &ctx).unwrap();

    let resumed = std::fs::read_to_string(&metrics_path).unwrap();
    assert_eq!(resumed, clean);

    let summary = read_summary(&summary_path).unwrap();
    assert_eq!(summary.integrity.n_rows_deduped, 200);
    let indices: Vec<u32> = resumed
        .lines()
        .filter_map(MetricsRow::parse_csv_line)
        .map(|r| r.perm_index)
        .collect();
    assert_eq!(indices, (0..200).collect::<Vec<_>>());
}

#[test]
fn corrupted_log_is_deduped_back_to_canonical_form() {
    let params = CellParams {
        p_skip: 0.05,
        slip_dollars_max: 25.0,
        ..zero_params()
    };

    let repo = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo.path(), 100, 10.0);
    let (cfg, cell) = run_fixture_cell(repo.path(), 200, params, 7);
    let metrics_path = cfg.cell_dir(&cell.id).join("metrics_compact.csv");

    // Corrupt: re-append 50 existing rows and a partial trailing line.
    let full = std::fs::read_to_string(&metrics_path).unwrap();
    let dupes: Vec<MetricsRow> = full
        .lines()
        .filter_map(MetricsRow::parse_csv_line)
        .filter(|r| (30..80).contains(&r.perm_index))
        .collect();
    assert_eq!(dupes.len(), 50);
    {
        let mut f = OpenOptions::new().append(true).open(&metrics_path).unwrap();
        for row in &dupes {
            writeln!(f, "{}", row.to_csv_line()).unwrap();
        }
        write!(f, "137,0.05").unwrap();
    }
    std::fs::remove_file(cfg.cell_dir(&cell.id).join("summary.json")).unwrap();

    let inputs = load_inputs(&cfg).unwrap();
    let base = Baseline::derive(&inputs, &cfg.kernel).unwrap();
    let ctx = SummaryCtx {
        baseline_pf: 1.5,
        n_cells: 1,
        min_trades: cfg.kernel.min_trades,
    };
    run_cell(&cfg, &inputs, &base, &cell, &ctx).unwrap();

    let text = std::fs::read_to_string(&metrics_path).unwrap();
    let rows: Vec<MetricsRow> = text.lines().filter_map(MetricsRow::parse_csv_line).collect();
    assert_eq!(rows.len(), 200);
    let indices: Vec<u32> = rows.iter().map(|r| r.perm_index).collect();
    assert_eq!(indices, (0..200).collect::<Vec<_>>());

    let summary = read_summary(&cfg.cell_dir(&cell.id).join("summary.json")).unwrap();
    assert_eq!(summary.integrity.n_duplicates_dropped, 50);
    assert_eq!(summary.integrity.n_rows_deduped, 200);
    assert!(cell_is_complete(&cfg.cell_dir(&cell.id), 200));
}

#[test]
fn deleted_summary_regenerates_identically() {
    let params = CellParams {
        p_skip: 0.10,
        ..zero_params()
    };

    let repo = tempfile::tempdir().unwrap();
    write_uniform_fixture(repo.path(), 100, 10.0);
    let (cfg, cell) = run_fixture_cell(repo.path(), 150, params, 21);
    let summary_path = cfg.cell_dir(&cell.id).join("summary.json");

    let first = read_summary(&summary_path).unwrap();
    std::fs::remove_file(&summary_path).unwrap();

    let inputs = load_inputs(&cfg).unwrap();
    let base = Baseline::derive(&inputs, &cfg.kernel).unwrap();
    let ctx = SummaryCtx {
        baseline_pf: 1.5,
        n_cells: 1,
        min_trades: cfg.kernel.min_trades,
    };
    run_cell(&cfg, &inputs, &base, &cell, &ctx).unwrap();

    let second = read_summary(&summary_path).unwrap();
    assert_eq!(first.p_raw, second.p_raw);
    assert_eq!(first.total_return_pct, second.total_return_pct);
    assert_eq!(first.profit_factor, second.profit_factor);
    assert_eq!(first.integrity.n_rows_deduped, second.integrity.n_rows_deduped);
}
