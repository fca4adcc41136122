use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

use stressgrid::config::{default_jobs, RunConfig};
use stressgrid::grid::GridSpec;
use stressgrid::runner::CellOutcome;
use stressgrid::scheduler;
use stressgrid::shutdown;

#[derive(Parser, Debug)]
#[command(name = "stressgrid")]
#[command(about = "Monte Carlo stress-testing engine for trading strategies")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the perturbation grid (resumes automatically)
    Run {
        /// Strategy repo root containing the input CSVs
        #[arg(short, long, default_value = ".")]
        repo_path: PathBuf,

        /// Run name; outputs go to backtest/out/montecarlo/<run_name>
        #[arg(short = 'n', long)]
        run_name: String,

        /// Permutations per cell
        #[arg(long, default_value = "200000")]
        n_per_cell: u32,

        /// Parallel worker processes
        #[arg(short, long, default_value_t = default_jobs())]
        jobs: usize,

        /// Rows per durable checkpoint
        #[arg(long, default_value = "2000")]
        checkpoint_every: u32,

        /// Global seed; every cell and permutation derives from it
        #[arg(long, default_value = "1337")]
        global_seed: u32,

        /// Restrict the grid to one delay value
        #[arg(long)]
        fixed_delay: Option<u8>,

        /// Minimum slippage axis value to keep
        #[arg(long)]
        slip_min: Option<f64>,

        /// Maximum slippage axis value to keep
        #[arg(long)]
        slip_max: Option<f64>,

        /// Keep the zero-slippage column even when slip_min excludes it
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        include_zero_slip: bool,

        /// Print per-cell status and exit without producing anything
        #[arg(long)]
        status_only: bool,
    },

    /// Print per-cell status for an existing run
    Status {
        #[arg(short, long, default_value = ".")]
        repo_path: PathBuf,

        #[arg(short = 'n', long)]
        run_name: String,

        /// Permutations per cell the run was started with
        #[arg(long, default_value = "200000")]
        n_per_cell: u32,
    },

    /// Worker-process entry point (spawned by `run`, one cell each)
    #[command(hide = true)]
    Cell {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        cell_id: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Workers inherit the coordinator's terminal; keep them quiet so the
    // per-cell transition lines stay readable.
    let is_worker = matches!(args.command, Commands::Cell { .. });
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else if is_worker {
        EnvFilter::new("stressgrid=warn")
    } else {
        EnvFilter::new("stressgrid=info")
    };
    fmt().with_env_filter(filter).init();

    // Ctrl-C / SIGTERM set a flag that both sides poll: the coordinator
    // stops spawning and forwards SIGTERM to its workers; a worker
    // finishes its current chunk append and checkpoints before exiting.
    shutdown::install()?;

    match args.command {
        Commands::Run {
            repo_path,
            run_name,
            n_per_cell,
            jobs,
            checkpoint_every,
            global_seed,
            fixed_delay,
            slip_min,
            slip_max,
            include_zero_slip,
            status_only,
        } => {
            let mut cfg = RunConfig::new(repo_path, run_name);
            cfg.n_per_cell = n_per_cell;
            cfg.jobs = jobs;
            cfg.checkpoint_every = checkpoint_every;
            cfg.global_seed = global_seed;
            cfg.fixed_delay = fixed_delay;
            cfg.slip_min = slip_min;
            cfg.slip_max = slip_max;
            cfg.include_zero_slip = include_zero_slip;
            cfg.status_only = status_only;

            scheduler::run_grid(&cfg)?;
        }

        Commands::Status {
            repo_path,
            run_name,
            n_per_cell,
        } => {
            let mut cfg = RunConfig::new(repo_path, run_name);
            cfg.n_per_cell = n_per_cell;
            // Prefer the run's own manifest so filters and grid match
            // what was actually dispatched.
            let (cfg, grid) = match stressgrid::config::load_manifest(&cfg.manifest_path()) {
                Ok(manifest) => (manifest.config, manifest.grid),
                Err(_) => (cfg, GridSpec::default()),
            };
            let cells = grid.enumerate(&cfg);
            scheduler::print_status(&cfg, &cells);
        }

        Commands::Cell { manifest, cell_id } => {
            if scheduler::run_worker(&manifest, &cell_id)? == CellOutcome::Interrupted {
                // 130: interrupted by signal. The cell has a durable
                // checkpoint and re-enters Resuming on the next pass.
                std::process::exit(130);
            }
        }
    }

    Ok(())
}
