//! Perturbation parameter grid: axes, enumeration, and canonical cell ids.

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    None,
    Permute,
    BlockPermute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    None,
    TradeBootstrap,
    BlockBootstrap,
}

/// The parameter axes the grid is the Cartesian product of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSpec {
    pub p_skip: Vec<f64>,
    pub slip_dollars_max: Vec<f64>,
    pub delay_bars_max: Vec<u8>,
    pub shuffle: Vec<ShuffleMode>,
    pub bootstrap: Vec<BootstrapMode>,
    pub block_len: Vec<u32>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            p_skip: vec![0.0, 0.05, 0.10, 0.20],
            slip_dollars_max: vec![0.0, 25.0, 50.0, 100.0],
            delay_bars_max: vec![0, 1, 2, 3],
            shuffle: vec![ShuffleMode::None, ShuffleMode::Permute, ShuffleMode::BlockPermute],
            bootstrap: vec![
                BootstrapMode::None,
                BootstrapMode::TradeBootstrap,
                BootstrapMode::BlockBootstrap,
            ],
            block_len: vec![5, 10, 20],
        }
    }
}

/// Axis indices identifying one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellKey {
    pub p_skip_idx: usize,
    pub slip_idx: usize,
    pub delay_idx: usize,
    pub shuffle_idx: usize,
    pub bootstrap_idx: usize,
    pub block_len_idx: usize,
}

/// Resolved parameter values for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    pub p_skip: f64,
    pub slip_dollars_max: f64,
    pub delay_bars_max: u8,
    pub shuffle_mode: ShuffleMode,
    pub bootstrap_mode: BootstrapMode,
    pub block_len: u32,
}

impl CellParams {
    /// Block length only matters when a block-structured stage is active.
    pub fn uses_blocks(&self) -> bool {
        self.shuffle_mode == ShuffleMode::BlockPermute
            || self.bootstrap_mode == BootstrapMode::BlockBootstrap
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    pub key: CellKey,
    pub params: CellParams,
}

/// Canonical cell id: the five axis indices joined by underscores, with
/// the block-length index folded into the last position only when a
/// block mode is active. Cells that don't use blocks never multiply
/// across the block axis.
pub fn cell_id(key: &CellKey, params: &CellParams) -> String {
    let mut id = format!(
        "{}_{}_{}_{}_{}",
        key.p_skip_idx, key.slip_idx, key.delay_idx, key.shuffle_idx, key.bootstrap_idx
    );
    if params.uses_blocks() {
        id.push_str(&format!("b{}", key.block_len_idx));
    }
    id
}

impl GridSpec {
    pub fn resolve(&self, key: &CellKey) -> CellParams {
        CellParams {
            p_skip: self.p_skip[key.p_skip_idx],
            slip_dollars_max: self.slip_dollars_max[key.slip_idx],
            delay_bars_max: self.delay_bars_max[key.delay_idx],
            shuffle_mode: self.shuffle[key.shuffle_idx],
            bootstrap_mode: self.bootstrap[key.bootstrap_idx],
            block_len: self.block_len[key.block_len_idx],
        }
    }

    /// Enumerate the filtered Cartesian product.
    ///
    /// Degenerate combinations are skipped: when neither the shuffle nor
    /// the bootstrap axis is in a block mode, only block index 0 is
    /// emitted, so the grid never contains duplicate cells that differ
    /// only by an inert block length.
    pub fn enumerate(&self, cfg: &RunConfig) -> Vec<Cell> {
        let mut cells = Vec::new();

        for (p_skip_idx, _) in self.p_skip.iter().enumerate() {
            for (slip_idx, &slip) in self.slip_dollars_max.iter().enumerate() {
                if !slip_allowed(slip, cfg) {
                    continue;
                }
                for (delay_idx, &delay) in self.delay_bars_max.iter().enumerate() {
                    if let Some(fixed) = cfg.fixed_delay {
                        if delay != fixed {
                            continue;
                        }
                    }
                    for (shuffle_idx, _) in self.shuffle.iter().enumerate() {
                        for (bootstrap_idx, _) in self.bootstrap.iter().enumerate() {
                            for (block_len_idx, _) in self.block_len.iter().enumerate() {
                                let key = CellKey {
                                    p_skip_idx,
                                    slip_idx,
                                    delay_idx,
                                    shuffle_idx,
                                    bootstrap_idx,
                                    block_len_idx,
                                };
                                let params = self.resolve(&key);
                                if !params.uses_blocks() && block_len_idx != 0 {
                                    continue;
                                }
                                cells.push(Cell {
                                    id: cell_id(&key, &params),
                                    key,
                                    params,
                                });
                            }
                        }
                    }
                }
            }
        }

        cells
    }
}

fn slip_allowed(slip: f64, cfg: &RunConfig) -> bool {
    if slip == 0.0 && cfg.include_zero_slip {
        return true;
    }
    if let Some(lo) = cfg.slip_min {
        if slip < lo {
            return false;
        }
    }
    if let Some(hi) = cfg.slip_max {
        if slip > hi {
            return false;
        }
    }
    true
}
