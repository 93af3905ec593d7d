//! Per-compartment execution context.
//!
//! Each compartment owns exactly one [`UnitContext`]: the entities whose
//! anchor position lies inside its rectangle, occupancy grids over those
//! entities, and a private RNG stream. Contexts never share mutable state,
//! which is what makes the compartment phase of a step embarrassingly
//! parallel.

use crate::compartment::Compartment;
use crate::entity::{Cluster, Particle};
use crate::{CellId, CoreError, ParticleId, RawStatistics, SimulationParameters};
use cellpond_index::{CompartmentGrid, OccupancyIndex};
use rand::rngs::SmallRng;
use rand::SeedableRng;

/// Grid payload locating one cell inside the owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub cluster_slot: u32,
    pub cell_slot: u32,
    pub cell_id: CellId,
}

/// Grid payload locating one particle inside the owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleEntry {
    pub slot: u32,
    pub particle_id: ParticleId,
}

/// Entities and lookup structures owned by one compartment.
pub struct UnitContext {
    compartment: Compartment,
    pub params: SimulationParameters,
    pub rng: SmallRng,
    pub clusters: Vec<Cluster>,
    pub particles: Vec<Particle>,
    cell_map: CompartmentGrid<IndexEntry>,
    particle_map: CompartmentGrid<ParticleEntry>,
    timestamp: u64,
}

impl UnitContext {
    pub fn new(
        compartment: Compartment,
        params: SimulationParameters,
        rng_seed: u64,
    ) -> Result<Self, CoreError> {
        let rect = compartment.rect();
        let make_grid_err =
            |_| CoreError::InvalidConfig("compartment rectangle has zero extent");
        let cell_map = CompartmentGrid::new(
            (rect.x, rect.y),
            rect.width as usize,
            rect.height as usize,
        )
        .map_err(make_grid_err)?;
        let particle_map = CompartmentGrid::new(
            (rect.x, rect.y),
            rect.width as usize,
            rect.height as usize,
        )
        .map_err(make_grid_err)?;
        Ok(Self {
            compartment,
            params,
            rng: SmallRng::seed_from_u64(rng_seed),
            clusters: Vec::new(),
            particles: Vec::new(),
            cell_map,
            particle_map,
            timestamp: 0,
        })
    }

    #[must_use]
    pub const fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    pub fn compartment_mut(&mut self) -> &mut Compartment {
        &mut self.compartment
    }

    /// Local step counter, incremented once per completed world step.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn inc_timestamp(&mut self) {
        self.timestamp += 1;
    }

    #[must_use]
    pub const fn cell_map(&self) -> &CompartmentGrid<IndexEntry> {
        &self.cell_map
    }

    #[must_use]
    pub const fn particle_map(&self) -> &CompartmentGrid<ParticleEntry> {
        &self.particle_map
    }

    /// Rebuild both occupancy grids from the current entity lists.
    ///
    /// Cells of a resident cluster may protrude past the compartment
    /// rectangle; those are simply not indexed here, their home lattice
    /// points belong to the neighbor's grid.
    pub fn rebuild_maps(&mut self) {
        self.cell_map.clear();
        self.particle_map.clear();
        for (cluster_slot, cluster) in self.clusters.iter().enumerate() {
            for (cell_slot, cell) in cluster.cells.iter().enumerate() {
                let entry = IndexEntry {
                    cluster_slot: cluster_slot as u32,
                    cell_slot: cell_slot as u32,
                    cell_id: cell.id,
                };
                let _ = self.cell_map.set((cell.pos.x, cell.pos.y), entry);
            }
        }
        for (slot, particle) in self.particles.iter().enumerate() {
            let entry = ParticleEntry {
                slot: slot as u32,
                particle_id: particle.id,
            };
            let _ = self.particle_map.set((particle.pos.x, particle.pos.y), entry);
        }
    }

    /// Resolve a grid entry back to its cell, rejecting stale entries.
    #[must_use]
    pub fn resolve(&self, entry: IndexEntry) -> Option<(&Cluster, &crate::entity::Cell)> {
        let cluster = self.clusters.get(entry.cluster_slot as usize)?;
        let cell = cluster.cells.get(entry.cell_slot as usize)?;
        (cell.id == entry.cell_id).then_some((cluster, cell))
    }

    /// Add this context's entity counts and energy totals onto `stats`.
    pub fn accumulate_statistics(&self, stats: &mut RawStatistics) {
        stats.num_clusters += self.clusters.len();
        stats.num_particles += self.particles.len();
        for cluster in &self.clusters {
            stats.num_cells += cluster.cells.len();
            for cell in &cluster.cells {
                stats.cell_energy += cell.energy;
                stats.num_tokens += cell.tokens.len();
                for token in &cell.tokens {
                    stats.token_energy += token.energy();
                }
            }
        }
        for particle in &self.particles {
            stats.particle_energy += particle.energy;
        }
    }
}
