use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the per-trade slippage magnitude is denominated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlipMode {
    /// `slip_max` is a dollar amount.
    Dollar,
    /// `slip_max` is a multiple of the trade's dollar risk R.
    RMult,
    /// `slip_max` is a fraction of the trade's notional.
    Pct,
}

/// State-dependent slippage intensity source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityMode {
    None,
    Vol,
    Dd,
    VolDd,
}

/// Kernel-level knobs that apply to every cell. These are run-level
/// configuration, not grid axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Minimum executed trades before a skip mask is accepted.
    pub min_trades: u32,
    /// How many times the skip mask is redrawn before proceeding degenerate.
    pub max_skip_redraws: u32,
    /// Adverse delay floor, in multiples of the trade's dollar risk R.
    pub delay_adverse_cap_r: f64,
    /// Delay only one side (entry or exit) per trade instead of both.
    pub delay_one_side: bool,
    pub slip_mode: SlipMode,
    pub intensity_mode: IntensityMode,
    /// Rolling window (equity points) for the volatility percentile signal.
    pub vol_window: usize,
    /// Starting equity for rebuilt paths. Defaults to the first equity
    /// curve point when not set.
    pub initial_capital: Option<f64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            min_trades: 30,
            max_skip_redraws: 50,
            delay_adverse_cap_r: 0.5,
            delay_one_side: false,
            slip_mode: SlipMode::Dollar,
            intensity_mode: IntensityMode::None,
            vol_window: 20,
            initial_capital: None,
        }
    }
}

/// Control surface for one stress run. Serialized into
/// `run_manifest.json` so worker processes resolve the exact same
/// configuration the coordinator dispatched with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Strategy repo root; inputs are looked up here (and under
    /// `backtest/`), outputs go under `backtest/out/montecarlo/`.
    pub repo_path: PathBuf,
    pub run_name: String,
    pub n_per_cell: u32,
    pub jobs: usize,
    pub checkpoint_every: u32,
    pub global_seed: u32,
    /// Restrict the grid to a single delay axis value.
    pub fixed_delay: Option<u8>,
    /// Keep only slippage axis values within `[slip_min, slip_max]`.
    pub slip_min: Option<f64>,
    pub slip_max: Option<f64>,
    /// Keep the zero-slippage column even when `slip_min` excludes it.
    pub include_zero_slip: bool,
    /// Print per-cell status and exit without producing anything.
    #[serde(default)]
    pub status_only: bool,
    pub kernel: KernelConfig,
}

impl RunConfig {
    pub fn new(repo_path: PathBuf, run_name: String) -> Self {
        Self {
            repo_path,
            run_name,
            n_per_cell: 200_000,
            jobs: default_jobs(),
            checkpoint_every: 2000,
            global_seed: 1337,
            fixed_delay: None,
            slip_min: None,
            slip_max: None,
            include_zero_slip: true,
            status_only: false,
            kernel: KernelConfig::default(),
        }
    }

    /// Root of this run's output tree.
    pub fn run_dir(&self) -> PathBuf {
        self.repo_path
            .join("backtest/out/montecarlo")
            .join(&self.run_name)
    }

    pub fn aggregated_dir(&self) -> PathBuf {
        self.run_dir().join("aggregated")
    }

    pub fn cell_dir(&self, cell_id: &str) -> PathBuf {
        self.run_dir().join("per_cell").join(cell_id)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.aggregated_dir().join("run_manifest.json")
    }

    /// Locate an input file at the repo root or under `backtest/`.
    pub fn input_path(&self, name: &str) -> Option<PathBuf> {
        for candidate in [self.repo_path.join(name), self.repo_path.join("backtest").join(name)] {
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Per-cell wall-clock timeout, scaled with the permutation count.
    pub fn cell_timeout(&self) -> std::time::Duration {
        let base_secs = 600.0 * (self.n_per_cell as f64 / 200_000.0);
        std::time::Duration::from_secs_f64(base_secs.max(60.0))
    }
}

pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
        .min(8)
}

/// Load a run manifest back into the worker process.
pub fn load_manifest(path: &Path) -> anyhow::Result<crate::scheduler::RunManifest> {
    use anyhow::Context;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read run manifest: {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed run manifest: {:?}", path))
}
