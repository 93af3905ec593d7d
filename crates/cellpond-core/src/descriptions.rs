//! Serializable content tree mirroring the runtime entities.
//!
//! Optional fields carry "absent means unspecified" semantics: building a
//! runtime entity from a description fills defaults where the field has one
//! and fails where the field is structurally required, while merging a
//! partial description onto another leaves absent fields unchanged.

use crate::entity::{Cell, Cluster, Connection, Particle};
use crate::function::CellFunction;
use crate::space::Vector2;
use crate::token::Token;
use crate::{CellId, ClusterId, CoreError, ParticleId, SimulationParameters};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDescription {
    pub cell_id: u64,
    pub distance: f64,
    pub angle_from_previous: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenDescription {
    pub energy: f64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellDescription {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pos: Option<Vector2>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub energy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub branch_number: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token_blocked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token_usages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub connections: Option<Vec<ConnectionDescription>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub function: Option<CellFunction>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tokens: Option<Vec<TokenDescription>>,
}

impl CellDescription {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_pos(mut self, pos: Vector2) -> Self {
        self.pos = Some(pos);
        self
    }

    #[must_use]
    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = Some(energy);
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, value: usize) -> Self {
        self.max_connections = Some(value);
        self
    }

    #[must_use]
    pub fn with_branch_number(mut self, value: u8) -> Self {
        self.branch_number = Some(value);
        self
    }

    #[must_use]
    pub fn with_function(mut self, function: CellFunction) -> Self {
        self.function = Some(function);
        self
    }

    pub fn add_token(&mut self, token: TokenDescription) -> &mut Self {
        self.tokens.get_or_insert_with(Vec::new).push(token);
        self
    }

    pub fn add_token_at(
        &mut self,
        index: usize,
        token: TokenDescription,
    ) -> Result<&mut Self, CoreError> {
        let tokens = self.tokens.get_or_insert_with(Vec::new);
        if index > tokens.len() {
            return Err(CoreError::TokenSlotOutOfRange {
                cell: CellId(self.id),
                index,
            });
        }
        tokens.insert(index, token);
        Ok(self)
    }

    pub fn del_token(&mut self, index: usize) -> Result<&mut Self, CoreError> {
        let tokens = self.tokens.as_mut().ok_or(CoreError::TokenSlotOutOfRange {
            cell: CellId(self.id),
            index,
        })?;
        if index >= tokens.len() {
            return Err(CoreError::TokenSlotOutOfRange {
                cell: CellId(self.id),
                index,
            });
        }
        tokens.remove(index);
        Ok(self)
    }

    #[must_use]
    pub fn is_connected_to(&self, id: u64) -> bool {
        self.connections
            .as_ref()
            .is_some_and(|connections| connections.iter().any(|c| c.cell_id == id))
    }

    /// Overwrite fields present in `change`; absent fields stay untouched.
    pub fn merge(&mut self, change: &CellDescription) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = &change.$field {
                    self.$field = Some(value.clone());
                }
            };
        }
        take!(pos);
        take!(energy);
        take!(max_connections);
        take!(branch_number);
        take!(token_blocked);
        take!(token_usages);
        take!(connections);
        take!(function);
        take!(tokens);
    }

    /// Build the runtime cell, filling defaults from `params`.
    pub fn build(&self, params: &SimulationParameters) -> Result<Cell, CoreError> {
        let pos = self.pos.ok_or(CoreError::MissingField("cell.pos"))?;
        let energy = self.energy.ok_or(CoreError::MissingField("cell.energy"))?;
        let connections = self
            .connections
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|c| Connection {
                cell_id: CellId(c.cell_id),
                distance: c.distance,
                angle_from_previous: c.angle_from_previous,
            })
            .collect::<SmallVec<[Connection; 6]>>();
        let tokens = self
            .tokens
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|t| Token::from_parts(t.energy, t.data.clone(), params.token_memory_size))
            .collect();
        Ok(Cell {
            id: CellId(self.id),
            pos,
            energy,
            max_connections: self.max_connections.unwrap_or(params.cell_max_bonds),
            branch_number: self.branch_number.unwrap_or(0),
            token_blocked: self.token_blocked.unwrap_or(false),
            token_usages: self.token_usages.unwrap_or(0),
            connections,
            function: self.function.clone().unwrap_or_default(),
            tokens,
        })
    }

    #[must_use]
    pub fn from_cell(cell: &Cell) -> Self {
        Self {
            id: cell.id.0,
            pos: Some(cell.pos),
            energy: Some(cell.energy),
            max_connections: Some(cell.max_connections),
            branch_number: Some(cell.branch_number),
            token_blocked: Some(cell.token_blocked),
            token_usages: Some(cell.token_usages),
            connections: Some(
                cell.connections
                    .iter()
                    .map(|c| ConnectionDescription {
                        cell_id: c.cell_id.0,
                        distance: c.distance,
                        angle_from_previous: c.angle_from_previous,
                    })
                    .collect(),
            ),
            function: Some(cell.function.clone()),
            tokens: Some(
                cell.tokens
                    .iter()
                    .map(|t| TokenDescription {
                        energy: t.energy(),
                        data: t.memory().to_vec(),
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterDescription {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub angle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cells: Option<Vec<CellDescription>>,
}

impl ClusterDescription {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn add_cell(&mut self, cell: CellDescription) -> &mut Self {
        self.cells.get_or_insert_with(Vec::new).push(cell);
        self
    }

    /// Mean of the member cell positions.
    #[must_use]
    pub fn pos_from_cells(&self) -> Vector2 {
        let Some(cells) = &self.cells else {
            return Vector2::default();
        };
        let mut sum = Vector2::default();
        let mut count = 0usize;
        for cell in cells {
            if let Some(pos) = cell.pos {
                sum += pos;
                count += 1;
            }
        }
        if count == 0 {
            Vector2::default()
        } else {
            sum / count as f64
        }
    }

    pub fn build(&self, params: &SimulationParameters) -> Result<Cluster, CoreError> {
        let cells = self
            .cells
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|cell| cell.build(params))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Cluster {
            id: ClusterId(self.id),
            angle: self.angle.unwrap_or(0.0),
            cells,
        })
    }

    #[must_use]
    pub fn from_cluster(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id.0,
            angle: Some(cluster.angle),
            cells: Some(cluster.cells.iter().map(CellDescription::from_cell).collect()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParticleDescription {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pos: Option<Vector2>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vel: Option<Vector2>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub energy: Option<f64>,
}

impl ParticleDescription {
    pub fn merge(&mut self, change: &ParticleDescription) {
        if let Some(pos) = change.pos {
            self.pos = Some(pos);
        }
        if let Some(vel) = change.vel {
            self.vel = Some(vel);
        }
        if let Some(energy) = change.energy {
            self.energy = Some(energy);
        }
    }

    pub fn build(&self) -> Result<Particle, CoreError> {
        Ok(Particle {
            id: ParticleId(self.id),
            pos: self.pos.ok_or(CoreError::MissingField("particle.pos"))?,
            vel: self.vel.unwrap_or_default(),
            energy: self
                .energy
                .ok_or(CoreError::MissingField("particle.energy"))?,
        })
    }

    #[must_use]
    pub fn from_particle(particle: &Particle) -> Self {
        Self {
            id: particle.id.0,
            pos: Some(particle.pos),
            vel: Some(particle.vel),
            energy: Some(particle.energy),
        }
    }
}

/// The full content tree: clusters with their cells plus free particles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataDescription {
    pub clusters: Vec<ClusterDescription>,
    pub particles: Vec<ParticleDescription>,
}

impl DataDescription {
    pub fn add_cluster(&mut self, cluster: ClusterDescription) -> &mut Self {
        self.clusters.push(cluster);
        self
    }

    pub fn add_particle(&mut self, particle: ParticleDescription) -> &mut Self {
        self.particles.push(particle);
        self
    }

    /// Mean position over every cell and particle.
    #[must_use]
    pub fn calc_center(&self) -> Vector2 {
        let mut sum = Vector2::default();
        let mut count = 0usize;
        for cluster in &self.clusters {
            for cell in cluster.cells.as_deref().unwrap_or(&[]) {
                if let Some(pos) = cell.pos {
                    sum += pos;
                    count += 1;
                }
            }
        }
        for particle in &self.particles {
            if let Some(pos) = particle.pos {
                sum += pos;
                count += 1;
            }
        }
        if count == 0 {
            Vector2::default()
        } else {
            sum / count as f64
        }
    }

    /// Translate every positioned entity by `delta`.
    pub fn shift(&mut self, delta: Vector2) {
        for cluster in &mut self.clusters {
            for cell in cluster.cells.as_deref_mut().unwrap_or(&mut []) {
                if let Some(pos) = &mut cell.pos {
                    *pos += delta;
                }
            }
        }
        for particle in &mut self.particles {
            if let Some(pos) = &mut particle.pos {
                *pos += delta;
            }
        }
    }
}
