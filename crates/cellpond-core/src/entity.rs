//! Cells, bonds, clusters, and free particles.
//!
//! Bond lists are kept circularly sorted by direction: each entry stores the
//! arc `angle_from_previous` to its predecessor and the arcs of one cell
//! always sum to 360 degrees. Insertion and removal maintain this without a
//! full re-sort, an O(degree) operation per endpoint.

use crate::function::CellFunction;
use crate::space::{angle_of_vector, SpaceMetric, Vector2};
use crate::token::Token;
use crate::{CellId, ClusterId, CoreError, ParticleId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::warn;

/// Tolerance for the 360-degree arc-sum invariant.
pub const ANGLE_SUM_TOLERANCE: f64 = 1e-6;

/// One half of a mirrored bond. The other endpoint stores its own
/// `angle_from_previous` relative to its local ordering; distance is shared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub cell_id: CellId,
    pub distance: f64,
    pub angle_from_previous: f64,
}

/// A spatially embedded cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    pub id: CellId,
    pub pos: Vector2,
    pub energy: f64,
    pub max_connections: usize,
    pub branch_number: u8,
    pub token_blocked: bool,
    pub token_usages: u32,
    pub connections: SmallVec<[Connection; 6]>,
    pub function: CellFunction,
    pub tokens: Vec<Token>,
}

impl Cell {
    #[must_use]
    pub fn is_connected_to(&self, id: CellId) -> bool {
        self.connections.iter().any(|c| c.cell_id == id)
    }

    #[must_use]
    pub fn connection_to(&self, id: CellId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.cell_id == id)
    }

    /// Sum of the stored arcs; 360 whenever at least one bond exists.
    #[must_use]
    pub fn angle_sum(&self) -> f64 {
        self.connections.iter().map(|c| c.angle_from_previous).sum()
    }

    pub fn add_token(&mut self, token: Token) {
        self.tokens.push(token);
    }

    pub fn insert_token_at(&mut self, index: usize, token: Token) -> Result<(), CoreError> {
        if index > self.tokens.len() {
            return Err(CoreError::TokenSlotOutOfRange {
                cell: self.id,
                index,
            });
        }
        self.tokens.insert(index, token);
        Ok(())
    }

    pub fn remove_token(&mut self, index: usize) -> Result<Token, CoreError> {
        if index >= self.tokens.len() {
            return Err(CoreError::TokenSlotOutOfRange {
                cell: self.id,
                index,
            });
        }
        Ok(self.tokens.remove(index))
    }
}

/// A free energy quantum outside any cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Particle {
    pub id: ParticleId,
    pub pos: Vector2,
    pub vel: Vector2,
    pub energy: f64,
}

/// One connected component of cells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub angle: f64,
    pub cells: Vec<Cell>,
}

impl Cluster {
    /// Mean of the cell positions.
    #[must_use]
    pub fn center(&self) -> Vector2 {
        if self.cells.is_empty() {
            return Vector2::default();
        }
        let mut sum = Vector2::default();
        for cell in &self.cells {
            sum += cell.pos;
        }
        sum / self.cells.len() as f64
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.cells.iter().map(|cell| cell.tokens.len()).sum()
    }

    /// Resolve a cell id to its index, populating `cache` on miss.
    pub fn cell_index(
        &self,
        id: CellId,
        cache: &mut HashMap<CellId, usize>,
    ) -> Result<usize, CoreError> {
        index_of(&self.cells, cache, id)
    }

    #[must_use]
    pub fn cell_by_id(&self, id: CellId) -> Option<&Cell> {
        self.cells.iter().find(|cell| cell.id == id)
    }

    /// Insert the mirrored bond between `a` and `b`.
    ///
    /// Atomic across both endpoints: capacity is checked up front so a
    /// rejection never leaves only one side connected. Inserting an existing
    /// bond is a no-op.
    pub fn add_connection(
        &mut self,
        a: CellId,
        b: CellId,
        metric: &SpaceMetric,
        cache: &mut HashMap<CellId, usize>,
    ) -> Result<(), CoreError> {
        let ia = index_of(&self.cells, cache, a)?;
        let ib = index_of(&self.cells, cache, b)?;
        if self.cells[ia].is_connected_to(b) {
            return Ok(());
        }
        for idx in [ia, ib] {
            let cell = &self.cells[idx];
            if cell.connections.len() >= cell.max_connections {
                return Err(CoreError::MaxConnectionsExceeded(cell.id));
            }
        }
        insert_half(&mut self.cells, cache, metric, ia, ib)?;
        insert_half(&mut self.cells, cache, metric, ib, ia)?;
        Ok(())
    }

    /// Remove the mirrored bond between `a` and `b`, merging the freed arc
    /// onto the following connection at each endpoint.
    pub fn remove_connection(
        &mut self,
        a: CellId,
        b: CellId,
        cache: &mut HashMap<CellId, usize>,
    ) -> Result<(), CoreError> {
        let ia = index_of(&self.cells, cache, a)?;
        let ib = index_of(&self.cells, cache, b)?;
        for (idx, other) in [(ia, b), (ib, a)] {
            let connections = &mut self.cells[idx].connections;
            let slot = connections
                .iter()
                .position(|c| c.cell_id == other)
                .ok_or(CoreError::UnknownCell(other))?;
            let removed = connections.remove(slot);
            match connections.len() {
                0 => {}
                1 => connections[0].angle_from_previous = 360.0,
                len => {
                    let follow = slot % len;
                    connections[follow].angle_from_previous += removed.angle_from_previous;
                }
            }
        }
        Ok(())
    }

    /// Refresh stored bond distances from current positions.
    pub fn refresh_connection_distances(&mut self, metric: &SpaceMetric) {
        let positions: HashMap<CellId, Vector2> =
            self.cells.iter().map(|cell| (cell.id, cell.pos)).collect();
        for cell in &mut self.cells {
            let own = cell.pos;
            for connection in &mut cell.connections {
                if let Some(other) = positions.get(&connection.cell_id) {
                    connection.distance = metric.distance(own, *other);
                }
            }
        }
    }

    /// Indices of cells grouped by bond reachability, in cell-list order.
    #[must_use]
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut cache = HashMap::new();
        let mut visited = vec![false; self.cells.len()];
        let mut components = Vec::new();
        for start in 0..self.cells.len() {
            if visited[start] {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = vec![start];
            visited[start] = true;
            while let Some(idx) = queue.pop() {
                component.push(idx);
                for connection in self.cells[idx].connections.clone() {
                    if let Ok(next) = index_of(&self.cells, &mut cache, connection.cell_id) {
                        if !visited[next] {
                            visited[next] = true;
                            queue.push(next);
                        }
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }
        components
    }

    /// Split into one cluster per connected component. Returns `None` when
    /// already connected; otherwise the first component keeps this id and the
    /// rest receive ids from `next_id`.
    pub fn split_components(
        &mut self,
        next_id: &mut dyn FnMut() -> u64,
    ) -> Option<Vec<Cluster>> {
        let components = self.connected_components();
        if components.len() <= 1 {
            return None;
        }
        let mut cells: Vec<Option<Cell>> = std::mem::take(&mut self.cells)
            .into_iter()
            .map(Some)
            .collect();
        let mut result = Vec::with_capacity(components.len());
        for (nth, component) in components.into_iter().enumerate() {
            let id = if nth == 0 {
                self.id
            } else {
                ClusterId(next_id())
            };
            let members = component
                .into_iter()
                .map(|idx| cells[idx].take().expect("component indices are disjoint"))
                .collect();
            result.push(Cluster {
                id,
                angle: self.angle,
                cells: members,
            });
        }
        Some(result)
    }

    /// Check the structural invariants: degree bound, arc sums, mirroring.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut cache = HashMap::new();
        for cell in &self.cells {
            if cell.connections.len() > cell.max_connections {
                return Err(CoreError::MaxConnectionsExceeded(cell.id));
            }
            if !cell.connections.is_empty() {
                let sum = cell.angle_sum();
                if (sum - 360.0).abs() > ANGLE_SUM_TOLERANCE {
                    return Err(CoreError::AngleSumBroken { cell: cell.id, sum });
                }
            }
            for connection in &cell.connections {
                let other = index_of(&self.cells, &mut cache, connection.cell_id)?;
                if !self.cells[other].is_connected_to(cell.id) {
                    return Err(CoreError::UnmirroredBond(cell.id, connection.cell_id));
                }
            }
        }
        Ok(())
    }
}

fn index_of(
    cells: &[Cell],
    cache: &mut HashMap<CellId, usize>,
    id: CellId,
) -> Result<usize, CoreError> {
    if let Some(&idx) = cache.get(&id) {
        if cells.get(idx).is_some_and(|cell| cell.id == id) {
            return Ok(idx);
        }
        cache.remove(&id);
    }
    for (idx, cell) in cells.iter().enumerate() {
        if cell.id == id {
            cache.insert(id, idx);
            return Ok(idx);
        }
    }
    Err(CoreError::UnknownCell(id))
}

/// Insert one endpoint's half of a new bond into its circular arc list.
fn insert_half(
    cells: &mut [Cell],
    cache: &mut HashMap<CellId, usize>,
    metric: &SpaceMetric,
    idx: usize,
    other_idx: usize,
) -> Result<(), CoreError> {
    let own_pos = cells[idx].pos;
    let other_pos = cells[other_idx].pos;
    let other_id = cells[other_idx].id;
    let new_angle = angle_of_vector(metric.displacement(own_pos, other_pos));
    let distance = metric.distance(own_pos, other_pos);

    let degree = cells[idx].connections.len();
    if degree == 0 {
        cells[idx].connections.push(Connection {
            cell_id: other_id,
            distance,
            angle_from_previous: 360.0,
        });
        return Ok(());
    }

    if degree == 1 {
        let first_id = cells[idx].connections[0].cell_id;
        let first_idx = index_of(cells, cache, first_id)?;
        let prev_angle = angle_of_vector(metric.displacement(own_pos, cells[first_idx].pos));
        let diff = new_angle - prev_angle;
        let connections = &mut cells[idx].connections;
        let new_connection = if diff >= 0.0 {
            connections[0].angle_from_previous = 360.0 - diff;
            Connection {
                cell_id: other_id,
                distance,
                angle_from_previous: diff,
            }
        } else {
            connections[0].angle_from_previous = -diff;
            Connection {
                cell_id: other_id,
                distance,
                angle_from_previous: 360.0 + diff,
            }
        };
        connections.push(new_connection);
        return Ok(());
    }

    // Walk the circular list until the arc containing the new direction is
    // found, accumulating absolute angles and wrapping past 360 explicitly.
    let first_id = cells[idx].connections[0].cell_id;
    let first_idx = index_of(cells, cache, first_id)?;
    let mut angle = angle_of_vector(metric.displacement(own_pos, cells[first_idx].pos));
    let mut slot = 1usize;
    let mut remaining = 2 * degree;
    loop {
        let next_angle = angle + cells[idx].connections[slot].angle_from_previous;
        if (angle < new_angle && new_angle <= next_angle)
            || (angle < new_angle + 360.0 && new_angle + 360.0 <= next_angle)
        {
            break;
        }
        remaining -= 1;
        if remaining == 0 {
            // Degenerate float accumulation; fall back to the current arc.
            warn!(
                cell = cells[idx].id.0,
                bearing = new_angle,
                "arc walk exhausted without a containing arc"
            );
            break;
        }
        slot += 1;
        if slot == cells[idx].connections.len() {
            slot = 0;
        }
        angle = next_angle;
        if angle > 360.0 {
            angle -= 360.0;
        }
    }

    let mut diff_new = new_angle - angle;
    if diff_new < 0.0 {
        diff_new += 360.0;
    }
    let connections = &mut cells[idx].connections;
    let arc = connections[slot].angle_from_previous;
    // Zero-width arcs split 50/50.
    let factor = if arc != 0.0 { diff_new / arc } else { 0.5 };
    connections.insert(
        slot,
        Connection {
            cell_id: other_id,
            distance,
            angle_from_previous: arc * factor,
        },
    );
    let follow = if slot + 1 == connections.len() {
        0
    } else {
        slot + 1
    };
    connections[follow].angle_from_previous = arc * (1.0 - factor);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulationParameters;

    fn cell(id: u64, x: f64, y: f64) -> Cell {
        Cell {
            id: CellId(id),
            pos: Vector2::new(x, y),
            energy: 100.0,
            max_connections: 6,
            branch_number: 0,
            token_blocked: false,
            token_usages: 0,
            connections: SmallVec::new(),
            function: CellFunction::Neutral,
            tokens: Vec::new(),
        }
    }

    fn cluster(cells: Vec<Cell>) -> Cluster {
        Cluster {
            id: ClusterId(1),
            angle: 0.0,
            cells,
        }
    }

    fn metric() -> SpaceMetric {
        SpaceMetric::new(1000, 1000)
    }

    #[test]
    fn first_connection_takes_the_full_circle() {
        let mut cluster = cluster(vec![cell(1, 0.0, 0.0), cell(2, 10.0, 0.0)]);
        let mut cache = HashMap::new();
        cluster
            .add_connection(CellId(1), CellId(2), &metric(), &mut cache)
            .expect("insert");
        let a = cluster.cell_by_id(CellId(1)).unwrap();
        assert_eq!(a.connections.len(), 1);
        assert!((a.connections[0].angle_from_previous - 360.0).abs() < 1e-12);
        assert!((a.connections[0].distance - 10.0).abs() < 1e-12);
        assert!(a.is_connected_to(CellId(2)));
        assert!(cluster.cell_by_id(CellId(2)).unwrap().is_connected_to(CellId(1)));
    }

    #[test]
    fn bearing_split_matches_geometry() {
        // A(0,0), B(10,0), C(5,10): angle(A->B)=0, angle(A->C)~63.43.
        let mut cluster = cluster(vec![
            cell(1, 0.0, 0.0),
            cell(2, 10.0, 0.0),
            cell(3, 5.0, 10.0),
        ]);
        let mut cache = HashMap::new();
        cluster
            .add_connection(CellId(1), CellId(2), &metric(), &mut cache)
            .expect("a-b");
        cluster
            .add_connection(CellId(1), CellId(3), &metric(), &mut cache)
            .expect("a-c");

        let a = cluster.cell_by_id(CellId(1)).unwrap();
        assert_eq!(a.connections.len(), 2);
        assert!((a.angle_sum() - 360.0).abs() < ANGLE_SUM_TOLERANCE);
        // The bond list stays in insertion order here; C's arc from B is the
        // geometric bearing difference.
        let to_c = a.connection_to(CellId(3)).unwrap();
        assert!((to_c.angle_from_previous - 63.434_948_822_922_01).abs() < 1e-6);
        let to_b = a.connection_to(CellId(2)).unwrap();
        assert!((to_b.angle_from_previous - (360.0 - 63.434_948_822_922_01)).abs() < 1e-6);
        cluster.validate().expect("invariants hold");
    }

    #[test]
    fn angle_sums_hold_for_every_degree() {
        // A hub at the origin bonded to neighbors in shuffled directions.
        let mut cluster = cluster(vec![
            cell(1, 50.0, 50.0),
            cell(2, 60.0, 50.0),
            cell(3, 50.0, 60.0),
            cell(4, 40.0, 45.0),
            cell(5, 55.0, 40.0),
            cell(6, 42.0, 58.0),
        ]);
        let mut cache = HashMap::new();
        for other in [2u64, 3, 4, 5, 6] {
            cluster
                .add_connection(CellId(1), CellId(other), &metric(), &mut cache)
                .expect("insert");
            let hub = cluster.cell_by_id(CellId(1)).unwrap();
            assert!(
                (hub.angle_sum() - 360.0).abs() < ANGLE_SUM_TOLERANCE,
                "sum after degree {}",
                hub.connections.len()
            );
        }
        cluster.validate().expect("invariants hold");
    }

    #[test]
    fn add_connection_is_symmetric() {
        let mut cluster = cluster(vec![cell(1, 0.0, 0.0), cell(2, 3.0, 4.0)]);
        let mut cache = HashMap::new();
        cluster
            .add_connection(CellId(1), CellId(2), &metric(), &mut cache)
            .expect("insert");
        let a = cluster.cell_by_id(CellId(1)).unwrap();
        let b = cluster.cell_by_id(CellId(2)).unwrap();
        assert!(a.is_connected_to(CellId(2)));
        assert!(b.is_connected_to(CellId(1)));
        assert!((a.connection_to(CellId(2)).unwrap().distance - 5.0).abs() < 1e-12);
        assert!((b.connection_to(CellId(1)).unwrap().distance - 5.0).abs() < 1e-12);
    }

    #[test]
    fn capacity_overflow_rolls_back_both_endpoints() {
        let mut cells = vec![
            cell(1, 0.0, 0.0),
            cell(2, 1.0, 0.0),
            cell(3, 0.0, 1.0),
            cell(4, 1.0, 1.0),
        ];
        cells[0].max_connections = 2;
        let mut cluster = cluster(cells);
        let mut cache = HashMap::new();
        cluster
            .add_connection(CellId(1), CellId(2), &metric(), &mut cache)
            .expect("first");
        cluster
            .add_connection(CellId(1), CellId(3), &metric(), &mut cache)
            .expect("second");

        let before_a = cluster.cell_by_id(CellId(1)).unwrap().connections.clone();
        let err = cluster
            .add_connection(CellId(1), CellId(4), &metric(), &mut cache)
            .unwrap_err();
        assert_eq!(err, CoreError::MaxConnectionsExceeded(CellId(1)));
        assert_eq!(
            cluster.cell_by_id(CellId(1)).unwrap().connections,
            before_a
        );
        assert!(cluster.cell_by_id(CellId(4)).unwrap().connections.is_empty());

        // Same failure when the saturated cell is the second endpoint.
        let err = cluster
            .add_connection(CellId(4), CellId(1), &metric(), &mut cache)
            .unwrap_err();
        assert_eq!(err, CoreError::MaxConnectionsExceeded(CellId(1)));
        assert!(cluster.cell_by_id(CellId(4)).unwrap().connections.is_empty());
    }

    #[test]
    fn corrupt_arc_list_still_accepts_a_bond() {
        // All-zero arcs contain no bearing; the walk must give up and insert
        // into the current arc instead of spinning.
        let mut cells = vec![
            cell(1, 50.0, 50.0),
            cell(2, 51.0, 50.0),
            cell(3, 50.0, 51.0),
            cell(4, 49.0, 50.0),
        ];
        cells[0].connections.push(Connection {
            cell_id: CellId(2),
            distance: 1.0,
            angle_from_previous: 0.0,
        });
        cells[0].connections.push(Connection {
            cell_id: CellId(3),
            distance: 1.0,
            angle_from_previous: 0.0,
        });
        cells[1].connections.push(Connection {
            cell_id: CellId(1),
            distance: 1.0,
            angle_from_previous: 360.0,
        });
        cells[2].connections.push(Connection {
            cell_id: CellId(1),
            distance: 1.0,
            angle_from_previous: 360.0,
        });
        let mut cluster = cluster(cells);
        let mut cache = HashMap::new();
        cluster
            .add_connection(CellId(1), CellId(4), &metric(), &mut cache)
            .expect("insertion survives");
        let hub = cluster.cell_by_id(CellId(1)).unwrap();
        assert_eq!(hub.connections.len(), 3);
        assert!(hub.is_connected_to(CellId(4)));
        assert!(cluster.cell_by_id(CellId(4)).unwrap().is_connected_to(CellId(1)));
    }

    #[test]
    fn removal_merges_the_freed_arc() {
        let mut cluster = cluster(vec![
            cell(1, 50.0, 50.0),
            cell(2, 60.0, 50.0),
            cell(3, 50.0, 60.0),
            cell(4, 40.0, 50.0),
        ]);
        let mut cache = HashMap::new();
        for other in [2u64, 3, 4] {
            cluster
                .add_connection(CellId(1), CellId(other), &metric(), &mut cache)
                .expect("insert");
        }
        cluster
            .remove_connection(CellId(1), CellId(3), &mut cache)
            .expect("remove");
        let hub = cluster.cell_by_id(CellId(1)).unwrap();
        assert_eq!(hub.connections.len(), 2);
        assert!((hub.angle_sum() - 360.0).abs() < ANGLE_SUM_TOLERANCE);
        assert!(!cluster.cell_by_id(CellId(3)).unwrap().is_connected_to(CellId(1)));
        cluster.validate().expect("invariants hold");

        cluster
            .remove_connection(CellId(1), CellId(2), &mut cache)
            .expect("remove");
        let hub = cluster.cell_by_id(CellId(1)).unwrap();
        assert_eq!(hub.connections.len(), 1);
        assert!((hub.connections[0].angle_from_previous - 360.0).abs() < 1e-12);
    }

    #[test]
    fn components_split_preserves_cells_and_ids() {
        let mut cluster = cluster(vec![
            cell(1, 0.0, 0.0),
            cell(2, 1.0, 0.0),
            cell(3, 10.0, 10.0),
            cell(4, 11.0, 10.0),
        ]);
        let mut cache = HashMap::new();
        cluster
            .add_connection(CellId(1), CellId(2), &metric(), &mut cache)
            .expect("insert");
        cluster
            .add_connection(CellId(3), CellId(4), &metric(), &mut cache)
            .expect("insert");

        let mut counter = 100u64;
        let parts = cluster
            .split_components(&mut || {
                counter += 1;
                counter
            })
            .expect("two components");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, ClusterId(1));
        assert_eq!(parts[1].id, ClusterId(101));
        assert_eq!(parts[0].cells.len(), 2);
        assert_eq!(parts[1].cells.len(), 2);
    }

    #[test]
    fn token_slots_are_index_addressed() {
        let params = SimulationParameters::default();
        let mut subject = cell(1, 0.0, 0.0);
        subject.add_token(Token::new(&params));
        let mut second = Token::new(&params);
        second.set_energy(9.0);
        subject.insert_token_at(0, second).expect("insert at head");
        assert_eq!(subject.tokens.len(), 2);
        let removed = subject.remove_token(0).expect("remove head");
        assert!((removed.energy() - 9.0).abs() < 1e-12);
        assert!(subject.remove_token(5).is_err());
    }
}
