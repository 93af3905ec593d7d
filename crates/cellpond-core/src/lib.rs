//! Core types for the cellpond workspace.
//!
//! The world is partitioned into rectangular compartments, each owning an
//! independent [`UnitContext`]. Cells aggregate into clusters whose bonds are
//! kept angularly sorted; byte-programmed tokens travel along the bonds and
//! trigger the behavior variant of each visited cell.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

mod compartment;
mod context;
mod descriptions;
mod entity;
mod function;
mod space;
mod token;
mod world;

pub use compartment::{Compartment, CompartmentRect, RelativeLocation};
pub use context::{IndexEntry, ParticleEntry, UnitContext};
pub use descriptions::{
    CellDescription, ClusterDescription, ConnectionDescription, DataDescription,
    ParticleDescription, TokenDescription,
};
pub use entity::{Cell, Cluster, Connection, Particle, ANGLE_SUM_TOLERANCE};
pub use function::{
    CellFunction, CommunicatorState, MessageData, communicator, energy_guidance,
};
pub use space::{angle_of_vector, unit_vector_of_angle, SpaceMetric, Vector2};
pub use token::Token;
pub use world::{
    BasicMotion, EngineEvent, MotionEngine, SimulationController, World,
};

new_key_type! {
    /// Stable handle for the unit context owned by one compartment.
    pub struct ContextKey;
}

/// Unique identifier of a cell, stable across serialization.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct CellId(pub u64);

/// Unique identifier of a cluster.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

/// Unique identifier of a free energy particle.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct ParticleId(pub u64);

/// Errors raised by the simulation core.
///
/// Invariant violations abort the operation that triggered them; they signal
/// a corrupted world or a construction-order bug. I/O never surfaces here.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("cell {0:?} already has its maximum number of connections")]
    MaxConnectionsExceeded(CellId),
    #[error("cell id {0:?} could not be resolved")]
    UnknownCell(CellId),
    #[error("cluster id {0:?} could not be resolved")]
    UnknownCluster(ClusterId),
    #[error("required field `{0}` is absent from the description")]
    MissingField(&'static str),
    #[error("no neighbor compartment registered for position ({0}, {1})")]
    NoNeighborRegistered(i64, i64),
    #[error("token slot {index} out of range for cell {cell:?}")]
    TokenSlotOutOfRange { cell: CellId, index: usize },
    #[error("connection angles of cell {cell:?} sum to {sum}, expected 360")]
    AngleSumBroken { cell: CellId, sum: f64 },
    #[error("bond between {0:?} and {1:?} is not mirrored")]
    UnmirroredBond(CellId, CellId),
}

/// Tunable parameters shared by every compartment of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationParameters {
    /// Below this separation the connectivity pass will not create new bonds.
    pub cell_min_distance: f64,
    /// Bonds longer than this are dissolved; closer unbonded cells fuse.
    pub cell_max_distance: f64,
    /// Default maximum degree assigned to cells built without an explicit one.
    pub cell_max_bonds: usize,
    /// Modulus for token branch numbers.
    pub cell_max_token_branch_number: u8,
    /// Maximum number of tokens a single cell may carry.
    pub cell_max_tokens: usize,
    /// Cells below this internal energy decay (handled by the motion engine).
    pub cell_min_energy: f64,
    /// Fixed byte length of every token memory in the run.
    pub token_memory_size: usize,
    /// Tokens whose energy falls below this are consumed.
    pub token_min_energy: f64,
    /// Search radius of the communicator cell function.
    pub communicator_range: f64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            cell_min_distance: 0.3,
            cell_max_distance: 1.3,
            cell_max_bonds: 6,
            cell_max_token_branch_number: 6,
            cell_max_tokens: 9,
            cell_min_energy: 50.0,
            token_memory_size: 256,
            token_min_energy: 3.0,
            communicator_range: 30.0,
        }
    }
}

impl SimulationParameters {
    /// Reject parameter combinations the core cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.token_memory_size == 0 {
            return Err(CoreError::InvalidConfig(
                "token_memory_size must be non-zero",
            ));
        }
        if self.cell_max_token_branch_number == 0 {
            return Err(CoreError::InvalidConfig(
                "cell_max_token_branch_number must be non-zero",
            ));
        }
        if self.cell_max_bonds == 0 || self.cell_max_tokens == 0 {
            return Err(CoreError::InvalidConfig(
                "cell_max_bonds and cell_max_tokens must be non-zero",
            ));
        }
        if self.cell_max_distance <= self.cell_min_distance {
            return Err(CoreError::InvalidConfig(
                "cell_max_distance must exceed cell_min_distance",
            ));
        }
        if self.communicator_range <= 0.0 || self.token_min_energy < 0.0 {
            return Err(CoreError::InvalidConfig(
                "communicator_range must be positive and token_min_energy non-negative",
            ));
        }
        Ok(())
    }
}

/// World geometry and partitioning settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralSettings {
    /// World width in lattice units.
    pub world_width: u32,
    /// World height in lattice units.
    pub world_height: u32,
    /// Number of compartment columns tiling the world.
    pub compartment_cols: u32,
    /// Number of compartment rows tiling the world.
    pub compartment_rows: u32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            world_width: 512,
            world_height: 512,
            compartment_cols: 2,
            compartment_rows: 2,
            rng_seed: None,
        }
    }
}

impl GeneralSettings {
    /// Validate the tiling, returning compartment dimensions in lattice units.
    pub fn compartment_dimensions(&self) -> Result<(u32, u32), CoreError> {
        if self.world_width == 0 || self.world_height == 0 {
            return Err(CoreError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        if self.compartment_cols == 0 || self.compartment_rows == 0 {
            return Err(CoreError::InvalidConfig(
                "compartment grid must be non-empty",
            ));
        }
        if self.world_width % self.compartment_cols != 0
            || self.world_height % self.compartment_rows != 0
        {
            return Err(CoreError::InvalidConfig(
                "world dimensions must be divisible by the compartment grid",
            ));
        }
        Ok((
            self.world_width / self.compartment_cols,
            self.world_height / self.compartment_rows,
        ))
    }
}

/// Named byte constants available to token programs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SymbolTable {
    entries: BTreeMap<String, String>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbol set preloaded into fresh simulations.
    #[must_use]
    pub fn default_symbols() -> Self {
        let mut table = Self::new();
        table.add_entry("BRANCH_NUMBER", "[0]");
        table.add_entry("COM_IN::DO_NOTHING", "0");
        table.add_entry("COM_IN::SET_LISTENING_CHANNEL", "1");
        table.add_entry("COM_IN::SEND_MESSAGE", "2");
        table.add_entry("COM_IN::RECEIVE_MESSAGE", "3");
        table.add_entry("COM_OUT::NO_NEW_MESSAGE", "0");
        table.add_entry("COM_OUT::NEW_MESSAGE", "1");
        table.add_entry("ENERGY_GUIDANCE_IN::DEACTIVATED", "0");
        table.add_entry("ENERGY_GUIDANCE_IN::BALANCE_CELL", "1");
        table.add_entry("ENERGY_GUIDANCE_IN::BALANCE_TOKEN", "2");
        table.add_entry("ENERGY_GUIDANCE_IN::BALANCE_BOTH", "3");
        table
    }

    pub fn add_entry(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries absent from `self` are copied over from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &SymbolTable) {
        for (key, value) in &defaults.entries {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Raw counters sampled after each simulation step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RawStatistics {
    pub timestep: u64,
    pub num_clusters: usize,
    pub num_cells: usize,
    pub num_tokens: usize,
    pub num_particles: usize,
    pub cell_energy: f64,
    pub token_energy: f64,
    pub particle_energy: f64,
}

/// Bounded history of raw statistics samples.
#[derive(Debug, Clone)]
pub struct StatisticsHistory {
    capacity: usize,
    entries: VecDeque<RawStatistics>,
}

impl StatisticsHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sample: RawStatistics) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(sample);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawStatistics> {
        self.entries.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&RawStatistics> {
        self.entries.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StatisticsHistory {
    fn default() -> Self {
        Self::new(4096)
    }
}
