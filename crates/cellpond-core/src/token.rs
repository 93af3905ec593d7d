//! Mobile byte-programmable tokens.

use crate::{CellId, SimulationParameters};
use serde::{Deserialize, Serialize};

/// A token: fixed-size memory plus energy, carried by a cell.
///
/// Memory length is invariant for the lifetime of the token and equals the
/// run's configured `token_memory_size`. The arrival edge is transient
/// routing state and not part of the token's externally visible identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    energy: f64,
    memory: Vec<u8>,
    #[serde(skip)]
    previous_cell: Option<CellId>,
}

impl Token {
    /// Fresh token with zeroed memory.
    #[must_use]
    pub fn new(params: &SimulationParameters) -> Self {
        Self {
            energy: 0.0,
            memory: vec![0; params.token_memory_size],
            previous_cell: None,
        }
    }

    /// Build a token from raw parts, normalizing the memory to
    /// `memory_size`: longer buffers are truncated, shorter ones zero-padded.
    #[must_use]
    pub fn from_parts(energy: f64, mut memory: Vec<u8>, memory_size: usize) -> Self {
        memory.truncate(memory_size);
        memory.resize(memory_size, 0);
        Self {
            energy,
            memory,
            previous_cell: None,
        }
    }

    /// The cell this token hopped in from, if it has moved at all.
    #[must_use]
    pub const fn previous_cell(&self) -> Option<CellId> {
        self.previous_cell
    }

    pub fn set_previous_cell(&mut self, cell: Option<CellId>) {
        self.previous_cell = cell;
    }

    /// Value copy of memory and energy.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Routing key derived from the first memory byte.
    #[must_use]
    pub fn access_number(&self, params: &SimulationParameters) -> u8 {
        self.memory[0] % params.cell_max_token_branch_number
    }

    pub fn set_access_number(&mut self, value: u8) {
        self.memory[0] = value;
    }

    #[must_use]
    pub const fn energy(&self) -> f64 {
        self.energy
    }

    pub fn set_energy(&mut self, energy: f64) {
        self.energy = energy;
    }

    pub fn add_energy(&mut self, delta: f64) {
        self.energy += delta;
    }

    #[must_use]
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    #[must_use]
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}
