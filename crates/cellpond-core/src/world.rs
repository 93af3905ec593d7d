//! World orchestration: compartment tiling, the step pipeline, and the
//! driver facade.
//!
//! A step runs in alternating phases. Compartment phases execute every
//! [`UnitContext`] in parallel with no shared mutable state; barrier phases
//! run single-threaded in row-major grid order and apply all cross-context
//! effects (entity transfers, message delivery, id allocation). Identical
//! seeds therefore produce identical runs regardless of thread count.

use crate::compartment::{Compartment, CompartmentRect, RelativeLocation};
use crate::context::UnitContext;
use crate::descriptions::{ClusterDescription, DataDescription, ParticleDescription};
use crate::entity::{Cluster, Particle};
use crate::function::{
    apply_energy_guidance, communicator, decode_angle, encode_angle, encode_distance,
    energy_guidance, read_byte, write_byte, CellFunction, MessageData,
};
use crate::space::{angle_of_vector, unit_vector_of_angle, SpaceMetric, Vector2};
use crate::token::Token;
use crate::{
    CellId, ContextKey, CoreError, GeneralSettings, ParticleId, RawStatistics,
    SimulationParameters, StatisticsHistory, SymbolTable,
};
use cellpond_index::OccupancyIndex;
use rand::Rng;
use rayon::prelude::*;
use slotmap::SlotMap;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Cross-context effect reported by a motion engine. Effects that need a
/// fresh id or touch another compartment are deferred to the barrier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// A cell decayed; its energy reappears as a free particle.
    EnergyReleased { pos: Vector2, energy: f64 },
    /// A particle drifted onto an occupied lattice point and fed that cell.
    EnergyAbsorbed { cell: CellId, energy: f64 },
}

/// Physics applied to one compartment during the movement phase.
///
/// Implementations receive exclusive access to a single context and must not
/// allocate entity ids; anything requiring either goes out via events.
pub trait MotionEngine: Send + Sync {
    fn advance(&self, ctx: &mut UnitContext, metric: &SpaceMetric) -> Vec<EngineEvent>;
}

/// Default motion: particles drift with a small heading jitter and feed
/// cells they land on; starved cells decay into free energy.
#[derive(Debug, Clone, Copy)]
pub struct BasicMotion {
    /// Maximum per-step heading change of a drifting particle, in degrees.
    pub heading_jitter: f64,
}

impl Default for BasicMotion {
    fn default() -> Self {
        Self { heading_jitter: 2.0 }
    }
}

impl MotionEngine for BasicMotion {
    fn advance(&self, ctx: &mut UnitContext, metric: &SpaceMetric) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        for particle in &mut ctx.particles {
            let speed = particle.vel.length();
            if speed > 0.0 && self.heading_jitter > 0.0 {
                let jitter = ctx.rng.random_range(-self.heading_jitter..=self.heading_jitter);
                let heading = angle_of_vector(particle.vel) + jitter;
                particle.vel = unit_vector_of_angle(heading) * speed;
            }
            particle.pos = metric.wrap(particle.pos + particle.vel);
        }
        ctx.rebuild_maps();

        // Particles sharing a lattice point coalesce. The map holds the
        // highest-slot occupant of each point, so earlier slots fold into it.
        let mut i = 0;
        while i < ctx.particles.len() {
            let pos = ctx.particles[i].pos;
            let merged = ctx
                .particle_map()
                .get((pos.x, pos.y))
                .filter(|entry| {
                    entry.slot as usize != i
                        && ctx
                            .particles
                            .get(entry.slot as usize)
                            .is_some_and(|p| p.id == entry.particle_id)
                })
                .map(|entry| entry.slot as usize);
            if let Some(target) = merged {
                let energy = ctx.particles[i].energy;
                ctx.particles[target].energy += energy;
                ctx.particles.remove(i);
                ctx.rebuild_maps();
            } else {
                i += 1;
            }
        }

        // Particles landing on an occupied lattice point feed that cell.
        let mut i = 0;
        while i < ctx.particles.len() {
            let pos = ctx.particles[i].pos;
            let hit = ctx
                .cell_map()
                .get((pos.x, pos.y))
                .filter(|entry| ctx.resolve(*entry).is_some());
            if let Some(entry) = hit {
                let energy = ctx.particles[i].energy;
                let cell = &mut ctx.clusters[entry.cluster_slot as usize].cells
                    [entry.cell_slot as usize];
                cell.energy += energy;
                events.push(EngineEvent::EnergyAbsorbed {
                    cell: cell.id,
                    energy,
                });
                ctx.particles.remove(i);
            } else {
                i += 1;
            }
        }

        // Starved cells decay; their energy (tokens included) is released.
        let min_energy = ctx.params.cell_min_energy;
        for cluster in &mut ctx.clusters {
            let doomed: Vec<CellId> = cluster
                .cells
                .iter()
                .filter(|cell| cell.energy < min_energy)
                .map(|cell| cell.id)
                .collect();
            for id in doomed {
                let partners: Vec<CellId> = cluster
                    .cell_by_id(id)
                    .map(|cell| cell.connections.iter().map(|b| b.cell_id).collect())
                    .unwrap_or_default();
                let mut cache = HashMap::new();
                for partner in partners {
                    let _ = cluster.remove_connection(id, partner, &mut cache);
                }
                if let Some(idx) = cluster.cells.iter().position(|cell| cell.id == id) {
                    let cell = cluster.cells.remove(idx);
                    let energy = cell.energy
                        + cell.tokens.iter().map(Token::energy).sum::<f64>();
                    events.push(EngineEvent::EnergyReleased {
                        pos: cell.pos,
                        energy,
                    });
                }
            }
        }
        ctx.clusters.retain(|cluster| !cluster.cells.is_empty());
        ctx.rebuild_maps();
        events
    }
}

/// A communicator send collected during the parallel token phase, applied at
/// the following barrier.
struct PendingSend {
    origin: (usize, usize, usize),
    sender_cell: CellId,
    pos: Vector2,
    message: MessageData,
}

/// The compartmented simulation state.
pub struct World {
    metric: SpaceMetric,
    settings: GeneralSettings,
    params: SimulationParameters,
    symbols: SymbolTable,
    contexts: SlotMap<ContextKey, UnitContext>,
    /// Context keys in row-major compartment order; this is the canonical
    /// iteration order of every barrier phase.
    grid: Vec<ContextKey>,
    cols: u32,
    rows: u32,
    comp_width: u32,
    comp_height: u32,
    next_entity_id: u64,
    timestep: u64,
    statistics: StatisticsHistory,
}

impl World {
    pub fn new(
        settings: GeneralSettings,
        params: SimulationParameters,
    ) -> Result<Self, CoreError> {
        params.validate()?;
        let (comp_width, comp_height) = settings.compartment_dimensions()?;
        let metric = SpaceMetric::new(settings.world_width, settings.world_height);
        let base_seed = settings.rng_seed.unwrap_or_else(rand::random);
        let cols = settings.compartment_cols;
        let rows = settings.compartment_rows;

        let mut contexts: SlotMap<ContextKey, UnitContext> = SlotMap::with_key();
        let mut grid = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let rect = CompartmentRect::new(
                    i64::from(col * comp_width),
                    i64::from(row * comp_height),
                    comp_width,
                    comp_height,
                );
                let index = u64::from(row * cols + col);
                let seed = base_seed ^ index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                let ctx = UnitContext::new(Compartment::new(rect), params.clone(), seed)?;
                grid.push(contexts.insert(ctx));
            }
        }
        for row in 0..rows {
            for col in 0..cols {
                let key = grid[(row * cols + col) as usize];
                for location in RelativeLocation::ALL {
                    let (dx, dy) = location.offset();
                    let ncol = (i64::from(col) + dx).rem_euclid(i64::from(cols)) as u32;
                    let nrow = (i64::from(row) + dy).rem_euclid(i64::from(rows)) as u32;
                    let neighbor = grid[(nrow * cols + ncol) as usize];
                    contexts[key]
                        .compartment_mut()
                        .register_neighbor_context(location, neighbor);
                }
            }
        }
        debug!(cols, rows, comp_width, comp_height, "world constructed");
        Ok(Self {
            metric,
            settings,
            params,
            symbols: SymbolTable::default_symbols(),
            contexts,
            grid,
            cols,
            rows,
            comp_width,
            comp_height,
            next_entity_id: 1,
            timestep: 0,
            statistics: StatisticsHistory::default(),
        })
    }

    #[must_use]
    pub const fn metric(&self) -> &SpaceMetric {
        &self.metric
    }

    #[must_use]
    pub const fn settings(&self) -> &GeneralSettings {
        &self.settings
    }

    #[must_use]
    pub const fn params(&self) -> &SimulationParameters {
        &self.params
    }

    #[must_use]
    pub const fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    #[must_use]
    pub const fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn set_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
    }

    #[must_use]
    pub const fn statistics(&self) -> &StatisticsHistory {
        &self.statistics
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.grid.len()
    }

    /// Contexts in row-major compartment order.
    pub fn contexts(&self) -> impl Iterator<Item = &UnitContext> {
        self.grid.iter().map(|&key| &self.contexts[key])
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }

    fn context_key_for_position(&self, pos: Vector2) -> ContextKey {
        let wrapped = self.metric.wrap(pos);
        let col = ((wrapped.x as u32) / self.comp_width).min(self.cols - 1);
        let row = ((wrapped.y as u32) / self.comp_height).min(self.rows - 1);
        self.grid[(row * self.cols + col) as usize]
    }

    fn contexts_in_grid_order(&mut self) -> Vec<&mut UnitContext> {
        let order: HashMap<ContextKey, usize> = self
            .grid
            .iter()
            .enumerate()
            .map(|(idx, &key)| (key, idx))
            .collect();
        let mut refs: Vec<(usize, &mut UnitContext)> = self
            .contexts
            .iter_mut()
            .map(|(key, ctx)| (order[&key], ctx))
            .collect();
        refs.sort_unstable_by_key(|(idx, _)| *idx);
        refs.into_iter().map(|(_, ctx)| ctx).collect()
    }

    /// Replace the whole world content. Positions are canonicalized and each
    /// cluster is homed by its center; the id counter advances past every id
    /// seen so later allocations never collide.
    pub fn set_data(&mut self, data: &DataDescription) -> Result<(), CoreError> {
        for &key in &self.grid {
            let ctx = &mut self.contexts[key];
            ctx.clusters.clear();
            ctx.particles.clear();
        }
        let mut max_id = 0u64;
        for desc in &data.clusters {
            let mut cluster = desc.build(&self.params)?;
            max_id = max_id.max(cluster.id.0);
            for cell in &mut cluster.cells {
                cell.pos = self.metric.wrap(cell.pos);
                max_id = max_id.max(cell.id.0);
            }
            cluster.refresh_connection_distances(&self.metric);
            cluster.validate()?;
            let key = self.context_key_for_position(cluster.center());
            self.contexts[key].clusters.push(cluster);
        }
        for desc in &data.particles {
            let mut particle = desc.build()?;
            particle.pos = self.metric.wrap(particle.pos);
            max_id = max_id.max(particle.id.0);
            let key = self.context_key_for_position(particle.pos);
            self.contexts[key].particles.push(particle);
        }
        self.next_entity_id = self.next_entity_id.max(max_id + 1);
        for &key in &self.grid {
            self.contexts[key].rebuild_maps();
        }
        Ok(())
    }

    /// Snapshot the whole world content in row-major compartment order.
    #[must_use]
    pub fn get_data(&self) -> DataDescription {
        let mut data = DataDescription::default();
        for &key in &self.grid {
            let ctx = &self.contexts[key];
            for cluster in &ctx.clusters {
                data.add_cluster(ClusterDescription::from_cluster(cluster));
            }
            for particle in &ctx.particles {
                data.add_particle(ParticleDescription::from_particle(particle));
            }
        }
        data
    }

    /// Check the structural invariants of every resident cluster.
    pub fn validate(&self) -> Result<(), CoreError> {
        for &key in &self.grid {
            for cluster in &self.contexts[key].clusters {
                cluster.validate()?;
            }
        }
        Ok(())
    }

    /// Advance the world by one step.
    pub fn step(&mut self, engine: &dyn MotionEngine) -> Result<(), CoreError> {
        let metric = self.metric;

        // Movement, compartment-parallel.
        let events: Vec<Vec<EngineEvent>> = {
            let mut ctxs = self.contexts_in_grid_order();
            ctxs.par_iter_mut()
                .map(|ctx| {
                    let events = engine.advance(ctx, &metric);
                    ctx.rebuild_maps();
                    events
                })
                .collect()
        };
        self.apply_engine_events(events);
        self.transfer_strays()?;

        // Connectivity, serial in grid order (allocates cluster ids).
        self.connectivity_pass()?;

        // Behavior execution, compartment-parallel; sends are deferred.
        let sends: Vec<Vec<PendingSend>> = {
            let mut ctxs = self.contexts_in_grid_order();
            ctxs.par_iter_mut()
                .map(|ctx| execute_cell_functions(ctx, &metric))
                .collect()
        };
        self.deliver_messages(sends);

        // Token routing, compartment-parallel.
        {
            let mut ctxs = self.contexts_in_grid_order();
            ctxs.par_iter_mut().for_each(|ctx| {
                let params = ctx.params.clone();
                for cluster in &mut ctx.clusters {
                    route_tokens(cluster, &params);
                }
            });
        }

        self.timestep += 1;
        let mut stats = RawStatistics {
            timestep: self.timestep,
            ..RawStatistics::default()
        };
        for &key in &self.grid {
            let ctx = &mut self.contexts[key];
            ctx.inc_timestamp();
            ctx.accumulate_statistics(&mut stats);
        }
        self.statistics.push(stats);
        trace!(
            timestep = self.timestep,
            clusters = stats.num_clusters,
            tokens = stats.num_tokens,
            "step complete"
        );
        Ok(())
    }

    /// Compute the statistics of the current state without stepping.
    #[must_use]
    pub fn current_statistics(&self) -> RawStatistics {
        let mut stats = RawStatistics {
            timestep: self.timestep,
            ..RawStatistics::default()
        };
        for &key in &self.grid {
            self.contexts[key].accumulate_statistics(&mut stats);
        }
        stats
    }

    fn apply_engine_events(&mut self, batches: Vec<Vec<EngineEvent>>) {
        let metric = self.metric;
        for events in batches {
            for event in events {
                match event {
                    EngineEvent::EnergyReleased { pos, energy } => {
                        let id = ParticleId(self.next_id());
                        let key = self.context_key_for_position(pos);
                        let ctx = &mut self.contexts[key];
                        let heading = ctx.rng.random_range(0.0..360.0);
                        ctx.particles.push(Particle {
                            id,
                            pos: metric.wrap(pos),
                            vel: unit_vector_of_angle(heading) * 0.5,
                            energy,
                        });
                        trace!(particle = id.0, energy, "decay energy released");
                    }
                    EngineEvent::EnergyAbsorbed { cell, energy } => {
                        trace!(cell = cell.0, energy, "particle absorbed");
                    }
                }
            }
        }
    }

    /// Move entities whose anchor left their compartment to the neighbor
    /// that now contains them. Runs single-threaded in grid order.
    fn transfer_strays(&mut self) -> Result<(), CoreError> {
        let metric = self.metric;
        let mut moved_clusters: Vec<(ContextKey, Cluster)> = Vec::new();
        let mut moved_particles: Vec<(ContextKey, Particle)> = Vec::new();
        for &key in &self.grid {
            let ctx = &mut self.contexts[key];
            let mut i = 0;
            while i < ctx.clusters.len() {
                let center = metric.wrap(ctx.clusters[i].center());
                if ctx.compartment().is_point_in_compartment(center) {
                    i += 1;
                    continue;
                }
                let dest = ctx.compartment().get_neighbor_context(center, &metric)?;
                moved_clusters.push((dest, ctx.clusters.remove(i)));
            }
            let mut i = 0;
            while i < ctx.particles.len() {
                let pos = ctx.particles[i].pos;
                if ctx.compartment().is_point_in_compartment(pos) {
                    i += 1;
                    continue;
                }
                let dest = ctx.compartment().get_neighbor_context(pos, &metric)?;
                moved_particles.push((dest, ctx.particles.remove(i)));
            }
        }
        for (dest, cluster) in moved_clusters {
            trace!(cluster = cluster.id.0, "cluster changed compartment");
            self.contexts[dest].clusters.push(cluster);
        }
        for (dest, particle) in moved_particles {
            self.contexts[dest].particles.push(particle);
        }
        for &key in &self.grid {
            self.contexts[key].rebuild_maps();
        }
        Ok(())
    }

    /// Dissolve overlong bonds, split disconnected clusters, then bond and
    /// fuse cells that drifted into bonding range.
    fn connectivity_pass(&mut self) -> Result<(), CoreError> {
        let metric = self.metric;
        let params = self.params.clone();
        for grid_idx in 0..self.grid.len() {
            let key = self.grid[grid_idx];
            let mut counter = self.next_entity_id;
            {
                let ctx = &mut self.contexts[key];

                for cluster in &mut ctx.clusters {
                    cluster.refresh_connection_distances(&metric);
                    let mut overlong: Vec<(CellId, CellId)> = Vec::new();
                    for cell in &cluster.cells {
                        for bond in &cell.connections {
                            if bond.distance > params.cell_max_distance && cell.id < bond.cell_id
                            {
                                overlong.push((cell.id, bond.cell_id));
                            }
                        }
                    }
                    let mut cache = HashMap::new();
                    for (a, b) in overlong {
                        cluster.remove_connection(a, b, &mut cache)?;
                        trace!(a = a.0, b = b.0, "bond dissolved");
                    }
                }

                let mut next = || {
                    let id = counter;
                    counter += 1;
                    id
                };
                let mut fragments = Vec::new();
                for cluster in &mut ctx.clusters {
                    if let Some(parts) = cluster.split_components(&mut next) {
                        debug!(cluster = cluster.id.0, parts = parts.len(), "cluster split");
                        let mut parts = parts.into_iter();
                        *cluster = parts.next().expect("split yields at least one part");
                        fragments.extend(parts);
                    }
                }
                ctx.clusters.extend(fragments);
                ctx.rebuild_maps();

                // Bonding candidates via the occupancy grid. The grid query
                // is lattice-center based, so widen the radius and re-check
                // exact distances before committing.
                let mut candidates: BTreeSet<(CellId, CellId)> = BTreeSet::new();
                for cluster in &ctx.clusters {
                    for cell in &cluster.cells {
                        let mut hits = Vec::new();
                        ctx.cell_map().visit_within(
                            (cell.pos.x, cell.pos.y),
                            params.cell_max_distance + 1.0,
                            &mut |entry, _| hits.push(entry),
                        );
                        for entry in hits {
                            let Some((_, other)) = ctx.resolve(entry) else {
                                continue;
                            };
                            if other.id == cell.id || cell.is_connected_to(other.id) {
                                continue;
                            }
                            let d = metric.distance(cell.pos, other.pos);
                            if d < params.cell_min_distance || d > params.cell_max_distance {
                                continue;
                            }
                            if cell.connections.len() >= cell.max_connections
                                || other.connections.len() >= other.max_connections
                            {
                                continue;
                            }
                            let pair = if cell.id < other.id {
                                (cell.id, other.id)
                            } else {
                                (other.id, cell.id)
                            };
                            candidates.insert(pair);
                        }
                    }
                }

                for (a, b) in candidates {
                    let find = |clusters: &[Cluster], id: CellId| {
                        clusters.iter().position(|cl| cl.cell_by_id(id).is_some())
                    };
                    let Some(ca) = find(&ctx.clusters, a) else { continue };
                    let Some(cb) = find(&ctx.clusters, b) else { continue };
                    // Earlier bonds of this pass may have used up capacity.
                    let has_capacity = |cluster: &Cluster, id: CellId| {
                        cluster
                            .cell_by_id(id)
                            .is_some_and(|c| c.connections.len() < c.max_connections)
                    };
                    if !has_capacity(&ctx.clusters[ca], a) || !has_capacity(&ctx.clusters[cb], b)
                    {
                        continue;
                    }
                    let target = if ca == cb {
                        ca
                    } else {
                        let (keep, absorb) = if ca < cb { (ca, cb) } else { (cb, ca) };
                        let absorbed = ctx.clusters.remove(absorb);
                        debug!(
                            kept = ctx.clusters[keep].id.0,
                            absorbed = absorbed.id.0,
                            "clusters fused"
                        );
                        ctx.clusters[keep].cells.extend(absorbed.cells);
                        keep
                    };
                    let mut cache = HashMap::new();
                    ctx.clusters[target].add_connection(a, b, &metric, &mut cache)?;
                }
                ctx.rebuild_maps();
            }
            self.next_entity_id = counter;
        }
        Ok(())
    }

    /// Deliver collected sends in grid order. For each send, candidate
    /// receivers are scanned in the origin context first, then its
    /// neighbors, each in cluster/cell slot order; the sender token's sent
    /// counter is written while the token still sits in its pre-routing
    /// slot.
    fn deliver_messages(&mut self, all_sends: Vec<Vec<PendingSend>>) {
        let metric = self.metric;
        let range = self.params.communicator_range;
        for (grid_idx, sends) in all_sends.into_iter().enumerate() {
            if sends.is_empty() {
                continue;
            }
            let origin_key = self.grid[grid_idx];
            let mut candidates: Vec<ContextKey> = vec![origin_key];
            for key in self.contexts[origin_key].compartment().neighbor_contexts() {
                if !candidates.contains(&key) {
                    candidates.push(key);
                }
            }
            for send in sends {
                let mut delivered = 0u32;
                for &key in &candidates {
                    let mut receivers: Vec<(usize, usize, Vector2)> = Vec::new();
                    {
                        let ctx = &self.contexts[key];
                        for (ci, cluster) in ctx.clusters.iter().enumerate() {
                            for (li, cell) in cluster.cells.iter().enumerate() {
                                let CellFunction::Communicator(state) = &cell.function else {
                                    continue;
                                };
                                if cell.id == send.sender_cell
                                    || state.listening_channel != send.message.channel
                                    || metric.distance(send.pos, cell.pos) > range
                                {
                                    continue;
                                }
                                receivers.push((ci, li, cell.pos));
                            }
                        }
                    }
                    for (ci, li, rpos) in receivers {
                        let cell = &mut self.contexts[key].clusters[ci].cells[li];
                        let CellFunction::Communicator(state) = &mut cell.function else {
                            continue;
                        };
                        // The angle byte holds the world-frame bearing from
                        // receiver to sender; the receiving token maps it
                        // into its own arrival frame when it reads the
                        // mailbox.
                        let bearing = angle_of_vector(metric.displacement(rpos, send.pos));
                        let stored = MessageData {
                            channel: send.message.channel,
                            message: send.message.message,
                            angle: encode_angle(bearing),
                            distance: encode_distance(metric.distance(rpos, send.pos)),
                        };
                        if state.deliver(stored) {
                            delivered += 1;
                        }
                    }
                }
                trace!(
                    sender = send.sender_cell.0,
                    channel = send.message.channel,
                    delivered,
                    "message sent"
                );
                let ctx = &mut self.contexts[origin_key];
                if let Some(cell) = ctx
                    .clusters
                    .get_mut(send.origin.0)
                    .and_then(|cluster| cluster.cells.get_mut(send.origin.1))
                    .filter(|cell| cell.id == send.sender_cell)
                {
                    if let Some(token) = cell.tokens.get_mut(send.origin.2) {
                        write_byte(
                            token.memory_mut(),
                            communicator::OUT_SENT_COUNT,
                            delivered.min(255) as u8,
                        );
                    }
                }
            }
        }
    }
}

/// Run every resident token through the behavior variant of its host cell.
/// Returns the communicator sends to apply at the barrier.
fn execute_cell_functions(ctx: &mut UnitContext, metric: &SpaceMetric) -> Vec<PendingSend> {
    let params = ctx.params.clone();
    let mut sends = Vec::new();
    for (cluster_slot, cluster) in ctx.clusters.iter_mut().enumerate() {
        for cell_slot in 0..cluster.cells.len() {
            if cluster.cells[cell_slot].tokens.is_empty() {
                continue;
            }
            // Bearing from the cell to each token's arrival edge, resolved
            // before the cell is borrowed mutably. Positions are frozen for
            // this phase, so the bearings stay valid throughout.
            let arrivals: Vec<Option<f64>> = {
                let cell = &cluster.cells[cell_slot];
                cell.tokens
                    .iter()
                    .map(|token| {
                        token
                            .previous_cell()
                            .and_then(|id| cluster.cell_by_id(id))
                            .map(|prev| {
                                angle_of_vector(metric.displacement(cell.pos, prev.pos))
                            })
                    })
                    .collect()
            };
            let cell = &mut cluster.cells[cell_slot];
            cell.token_usages += cell.tokens.len() as u32;
            for token_slot in 0..cell.tokens.len() {
                match &mut cell.function {
                    CellFunction::Neutral => {}
                    CellFunction::EnergyGuidance => {
                        let memory = cell.tokens[token_slot].memory();
                        let command = read_byte(memory, energy_guidance::COMMAND);
                        let value = read_byte(memory, energy_guidance::IN_VALUE);
                        let mut cell_energy = cell.energy;
                        let mut token_energy = cell.tokens[token_slot].energy();
                        apply_energy_guidance(
                            command,
                            value,
                            &mut cell_energy,
                            &mut token_energy,
                            &params,
                        );
                        cell.energy = cell_energy;
                        cell.tokens[token_slot].set_energy(token_energy);
                    }
                    CellFunction::Communicator(state) => {
                        let memory = cell.tokens[token_slot].memory();
                        let command =
                            read_byte(memory, communicator::COMMAND) % communicator::CMD_MODULUS;
                        match command {
                            communicator::CMD_SET_LISTENING_CHANNEL => {
                                state.listening_channel =
                                    read_byte(memory, communicator::IN_CHANNEL);
                            }
                            communicator::CMD_SEND_MESSAGE => {
                                sends.push(PendingSend {
                                    origin: (cluster_slot, cell_slot, token_slot),
                                    sender_cell: cell.id,
                                    pos: cell.pos,
                                    message: MessageData {
                                        channel: read_byte(memory, communicator::IN_CHANNEL),
                                        message: read_byte(memory, communicator::IN_MESSAGE),
                                        angle: read_byte(memory, communicator::IN_ANGLE),
                                        distance: read_byte(memory, communicator::IN_DISTANCE),
                                    },
                                });
                            }
                            communicator::CMD_RECEIVE_MESSAGE => {
                                let received = state.take_received();
                                let memory = cell.tokens[token_slot].memory_mut();
                                match received {
                                    Some(msg) => {
                                        // Sender direction relative to the
                                        // edge this token arrived on; a token
                                        // with no arrival edge reads the
                                        // world-frame bearing unchanged.
                                        let orientation =
                                            arrivals[token_slot].unwrap_or(0.0);
                                        let relative =
                                            decode_angle(msg.angle) - orientation;
                                        write_byte(
                                            memory,
                                            communicator::OUT_RECEIVED_NEW,
                                            communicator::OUT_NEW_MESSAGE,
                                        );
                                        write_byte(
                                            memory,
                                            communicator::OUT_RECEIVED_MESSAGE,
                                            msg.message,
                                        );
                                        write_byte(
                                            memory,
                                            communicator::OUT_RECEIVED_ANGLE,
                                            encode_angle(relative),
                                        );
                                        write_byte(
                                            memory,
                                            communicator::OUT_RECEIVED_DISTANCE,
                                            msg.distance,
                                        );
                                    }
                                    None => write_byte(
                                        memory,
                                        communicator::OUT_RECEIVED_NEW,
                                        communicator::OUT_NO_NEW_MESSAGE,
                                    ),
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    sends
}

/// Move every token one hop along the bonds of its host cluster.
///
/// A token below the energy floor is consumed by its host. Otherwise it
/// branches to every bonded cell carrying the next branch number that is not
/// blocked; with no target its energy also feeds the host. Duplicates split
/// the energy equally, and a target already at token capacity absorbs the
/// overflow token's energy instead. Every forwarded token records the cell
/// it hopped off from, the arrival edge directional behaviors resolve
/// against.
fn route_tokens(cluster: &mut Cluster, params: &SimulationParameters) {
    let modulus = params.cell_max_token_branch_number;
    let index_by_id: HashMap<CellId, usize> = cluster
        .cells
        .iter()
        .enumerate()
        .map(|(idx, cell)| (cell.id, idx))
        .collect();
    let mut inbox: Vec<Vec<Token>> = vec![Vec::new(); cluster.cells.len()];
    for idx in 0..cluster.cells.len() {
        let tokens = std::mem::take(&mut cluster.cells[idx].tokens);
        for token in tokens {
            if token.energy() < params.token_min_energy {
                cluster.cells[idx].energy += token.energy();
                continue;
            }
            let host = cluster.cells[idx].id;
            let next_branch = cluster.cells[idx].branch_number.wrapping_add(1) % modulus;
            let mut targets: Vec<usize> = Vec::new();
            for bond in &cluster.cells[idx].connections {
                let Some(&t) = index_by_id.get(&bond.cell_id) else {
                    continue;
                };
                let target = &cluster.cells[t];
                if target.branch_number == next_branch && !target.token_blocked {
                    targets.push(t);
                }
            }
            if targets.is_empty() {
                cluster.cells[idx].energy += token.energy();
                continue;
            }
            let share = token.energy() / targets.len() as f64;
            for &t in &targets {
                let mut copy = token.duplicate();
                copy.set_energy(share);
                copy.set_access_number(cluster.cells[t].branch_number);
                copy.set_previous_cell(Some(host));
                inbox[t].push(copy);
            }
        }
    }
    for (idx, tokens) in inbox.into_iter().enumerate() {
        for token in tokens {
            if cluster.cells[idx].tokens.len() < params.cell_max_tokens {
                cluster.cells[idx].tokens.push(token);
            } else {
                cluster.cells[idx].energy += token.energy();
            }
        }
    }
}

/// Driver facade owning one world and its motion engine.
pub struct SimulationController {
    world: World,
    engine: Box<dyn MotionEngine>,
}

impl SimulationController {
    /// Fresh empty simulation with the default motion engine and the
    /// default symbol set.
    pub fn new_simulation(
        settings: GeneralSettings,
        params: SimulationParameters,
    ) -> Result<Self, CoreError> {
        Self::with_engine(settings, params, Box::new(BasicMotion::default()))
    }

    pub fn with_engine(
        settings: GeneralSettings,
        params: SimulationParameters,
        engine: Box<dyn MotionEngine>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            world: World::new(settings, params)?,
            engine,
        })
    }

    pub fn set_clustered_simulation_data(
        &mut self,
        data: &DataDescription,
    ) -> Result<(), CoreError> {
        self.world.set_data(data)
    }

    #[must_use]
    pub fn get_clustered_simulation_data(&self) -> DataDescription {
        self.world.get_data()
    }

    pub fn calc_timesteps(&mut self, count: u64) -> Result<(), CoreError> {
        for _ in 0..count {
            self.world.step(self.engine.as_ref())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn get_simulation_parameters(&self) -> &SimulationParameters {
        self.world.params()
    }

    #[must_use]
    pub fn get_general_settings(&self) -> &GeneralSettings {
        self.world.settings()
    }

    #[must_use]
    pub fn get_symbol_table(&self) -> &SymbolTable {
        self.world.symbols()
    }

    pub fn get_symbol_table_mut(&mut self) -> &mut SymbolTable {
        self.world.symbols_mut()
    }

    #[must_use]
    pub fn get_current_timestep(&self) -> u64 {
        self.world.timestep()
    }

    pub fn set_current_timestep(&mut self, timestep: u64) {
        self.world.set_timestep(timestep);
    }

    #[must_use]
    pub fn get_statistics_history(&self) -> &StatisticsHistory {
        self.world.statistics()
    }

    #[must_use]
    pub fn get_raw_statistics(&self) -> RawStatistics {
        self.world.current_statistics()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.world.validate()
    }

    #[must_use]
    pub const fn world(&self) -> &World {
        &self.world
    }
}
