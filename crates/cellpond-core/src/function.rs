//! Per-cell behavior variants executed when a token visits.
//!
//! The finite behavior set is a tagged enum dispatched by a single match in
//! the token execution loop; every variant is plain data plus pure helpers.

use crate::SimulationParameters;
use serde::{Deserialize, Serialize};

/// Compact message record exchanged between communicator cells.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageData {
    pub channel: u8,
    pub message: u8,
    pub angle: u8,
    pub distance: u8,
}

/// Mailbox state of a communicator cell. At most one inbound message is
/// pending; contention is resolved by dropping, never by overwriting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommunicatorState {
    pub listening_channel: u8,
    pub received: Option<MessageData>,
}

impl CommunicatorState {
    /// Store `message` if the mailbox is empty. Returns delivery success.
    pub fn deliver(&mut self, message: MessageData) -> bool {
        if self.received.is_some() {
            return false;
        }
        self.received = Some(message);
        true
    }

    /// Read and clear the pending message.
    pub fn take_received(&mut self) -> Option<MessageData> {
        self.received.take()
    }
}

/// The behavior variant resident on a cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum CellFunction {
    #[default]
    Neutral,
    EnergyGuidance,
    Communicator(CommunicatorState),
}

impl CellFunction {
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::EnergyGuidance => "energy-guidance",
            Self::Communicator(_) => "communicator",
        }
    }

    #[must_use]
    pub const fn is_communicator(&self) -> bool {
        matches!(self, Self::Communicator(_))
    }
}

/// Token memory layout and command set of the communicator function.
pub mod communicator {
    /// Command byte consumed on each visit.
    pub const COMMAND: usize = 26;
    pub const IN_CHANNEL: usize = 27;
    pub const IN_MESSAGE: usize = 28;
    pub const IN_ANGLE: usize = 29;
    pub const IN_DISTANCE: usize = 30;
    pub const OUT_SENT_COUNT: usize = 31;
    pub const OUT_RECEIVED_NEW: usize = 32;
    pub const OUT_RECEIVED_MESSAGE: usize = 33;
    pub const OUT_RECEIVED_ANGLE: usize = 34;
    pub const OUT_RECEIVED_DISTANCE: usize = 35;

    pub const CMD_DO_NOTHING: u8 = 0;
    pub const CMD_SET_LISTENING_CHANNEL: u8 = 1;
    pub const CMD_SEND_MESSAGE: u8 = 2;
    pub const CMD_RECEIVE_MESSAGE: u8 = 3;
    /// Number of commands; the command byte is taken modulo this.
    pub const CMD_MODULUS: u8 = 4;

    pub const OUT_NO_NEW_MESSAGE: u8 = 0;
    pub const OUT_NEW_MESSAGE: u8 = 1;
}

/// Token memory layout and command set of the energy guidance function.
pub mod energy_guidance {
    pub const COMMAND: usize = 24;
    pub const IN_VALUE: usize = 25;

    pub const CMD_DEACTIVATED: u8 = 0;
    pub const CMD_BALANCE_CELL: u8 = 1;
    pub const CMD_BALANCE_TOKEN: u8 = 2;
    pub const CMD_BALANCE_BOTH: u8 = 3;
    pub const CMD_MODULUS: u8 = 4;

    /// Energy moved per balancing step.
    pub const TRANSFER_AMOUNT: f64 = 10.0;
}

/// Safe byte read; memories shorter than the layout read as zero.
#[must_use]
pub fn read_byte(memory: &[u8], offset: usize) -> u8 {
    memory.get(offset).copied().unwrap_or(0)
}

/// Safe byte write; out-of-range offsets are ignored.
pub fn write_byte(memory: &mut [u8], offset: usize, value: u8) {
    if let Some(slot) = memory.get_mut(offset) {
        *slot = value;
    }
}

/// Quantize an angle in degrees onto one byte (360° / 256 steps).
#[must_use]
pub fn encode_angle(degrees: f64) -> u8 {
    let normalized = degrees.rem_euclid(360.0);
    ((normalized / 360.0) * 256.0) as u8
}

/// Inverse of [`encode_angle`], up to quantization.
#[must_use]
pub fn decode_angle(byte: u8) -> f64 {
    f64::from(byte) / 256.0 * 360.0
}

/// Clamp a distance onto one byte.
#[must_use]
pub fn encode_distance(distance: f64) -> u8 {
    distance.round().clamp(0.0, 255.0) as u8
}

/// Apply one energy guidance step between a cell and the visiting token.
pub fn apply_energy_guidance(
    command: u8,
    value: u8,
    cell_energy: &mut f64,
    token_energy: &mut f64,
    params: &SimulationParameters,
) {
    use energy_guidance::*;
    let desired_cell = params.cell_min_energy + f64::from(value);
    let desired_token = params.token_min_energy + f64::from(value);
    match command % CMD_MODULUS {
        CMD_BALANCE_CELL => {
            balance_cell(desired_cell, cell_energy, token_energy, params);
        }
        CMD_BALANCE_TOKEN => {
            balance_token(desired_token, cell_energy, token_energy, params);
        }
        CMD_BALANCE_BOTH => {
            balance_token(desired_token, cell_energy, token_energy, params);
            balance_cell(desired_cell, cell_energy, token_energy, params);
        }
        _ => {}
    }
}

fn balance_cell(
    desired: f64,
    cell_energy: &mut f64,
    token_energy: &mut f64,
    params: &SimulationParameters,
) {
    use energy_guidance::TRANSFER_AMOUNT;
    if *cell_energy > desired + TRANSFER_AMOUNT {
        *cell_energy -= TRANSFER_AMOUNT;
        *token_energy += TRANSFER_AMOUNT;
    } else if *cell_energy < desired
        && *token_energy > params.token_min_energy + TRANSFER_AMOUNT
    {
        *cell_energy += TRANSFER_AMOUNT;
        *token_energy -= TRANSFER_AMOUNT;
    }
}

fn balance_token(
    desired: f64,
    cell_energy: &mut f64,
    token_energy: &mut f64,
    params: &SimulationParameters,
) {
    use energy_guidance::TRANSFER_AMOUNT;
    if *token_energy > desired + TRANSFER_AMOUNT {
        *token_energy -= TRANSFER_AMOUNT;
        *cell_energy += TRANSFER_AMOUNT;
    } else if *token_energy < desired && *cell_energy > params.cell_min_energy {
        *token_energy += TRANSFER_AMOUNT;
        *cell_energy -= TRANSFER_AMOUNT;
    }
}
