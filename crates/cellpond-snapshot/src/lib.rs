//! Snapshot persistence for cellpond simulations.
//!
//! A snapshot is three independent JSON sections: timestep plus settings,
//! the symbol table, and the content tree. Sections serialize canonically
//! (maps are ordered, struct fields keep declaration order), so a snapshot
//! produced from a deserialized snapshot is byte-identical to its source.

use cellpond_core::{
    CoreError, DataDescription, GeneralSettings, RawStatistics, SimulationController,
    SimulationParameters, StatisticsHistory, SymbolTable,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Version tag carried in the settings section. A mismatch is a hard error;
/// there is no cross-version migration.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot format version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("malformed snapshot section `{section}`")]
    Malformed {
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o failure on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// First snapshot section: format tag, timestep, and both settings blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TimestepAndSettings {
    version: u32,
    timestep: u64,
    general: GeneralSettings,
    parameters: SimulationParameters,
}

/// The wire form of a simulation: three JSON strings, stored as one JSON
/// document on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedSimulation {
    pub timestep_and_settings: String,
    pub symbol_map: String,
    pub content: String,
}

/// A snapshot decoded back into structured form, ready to seed a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct DeserializedSimulation {
    pub timestep: u64,
    pub general: GeneralSettings,
    pub parameters: SimulationParameters,
    pub symbol_map: SymbolTable,
    pub content: DataDescription,
}

pub struct Serializer;

impl Serializer {
    /// Snapshot a live simulation.
    pub fn serialize(
        controller: &SimulationController,
    ) -> Result<SerializedSimulation, SnapshotError> {
        Self::serialize_parts(
            controller.get_current_timestep(),
            controller.get_general_settings(),
            controller.get_simulation_parameters(),
            controller.get_symbol_table(),
            &controller.get_clustered_simulation_data(),
        )
    }

    pub fn serialize_parts(
        timestep: u64,
        general: &GeneralSettings,
        parameters: &SimulationParameters,
        symbols: &SymbolTable,
        content: &DataDescription,
    ) -> Result<SerializedSimulation, SnapshotError> {
        let settings = TimestepAndSettings {
            version: FORMAT_VERSION,
            timestep,
            general: general.clone(),
            parameters: parameters.clone(),
        };
        let section = |section: &'static str| move |source| SnapshotError::Malformed {
            section,
            source,
        };
        Ok(SerializedSimulation {
            timestep_and_settings: serde_json::to_string(&settings)
                .map_err(section("timestep_and_settings"))?,
            symbol_map: serde_json::to_string(symbols).map_err(section("symbol_map"))?,
            content: serde_json::to_string(content).map_err(section("content"))?,
        })
    }

    /// Decode all three sections, verifying the format tag first.
    pub fn deserialize(
        serialized: &SerializedSimulation,
    ) -> Result<DeserializedSimulation, SnapshotError> {
        let settings: TimestepAndSettings =
            serde_json::from_str(&serialized.timestep_and_settings).map_err(|source| {
                SnapshotError::Malformed {
                    section: "timestep_and_settings",
                    source,
                }
            })?;
        if settings.version != FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: settings.version,
                expected: FORMAT_VERSION,
            });
        }
        let symbol_map: SymbolTable =
            serde_json::from_str(&serialized.symbol_map).map_err(|source| {
                SnapshotError::Malformed {
                    section: "symbol_map",
                    source,
                }
            })?;
        let content: DataDescription =
            serde_json::from_str(&serialized.content).map_err(|source| {
                SnapshotError::Malformed {
                    section: "content",
                    source,
                }
            })?;
        Ok(DeserializedSimulation {
            timestep: settings.timestep,
            general: settings.general,
            parameters: settings.parameters,
            symbol_map,
            content,
        })
    }

    /// Stand up a controller from a decoded snapshot. Token memories are
    /// normalized to the snapshot's configured size while loading; symbols
    /// absent from the snapshot fall back to the built-in defaults.
    pub fn build_controller(
        snapshot: &DeserializedSimulation,
    ) -> Result<SimulationController, SnapshotError> {
        let mut controller = SimulationController::new_simulation(
            snapshot.general.clone(),
            snapshot.parameters.clone(),
        )?;
        let mut symbols = snapshot.symbol_map.clone();
        symbols.merge_defaults(&SymbolTable::default_symbols());
        *controller.get_symbol_table_mut() = symbols;
        controller.set_clustered_simulation_data(&snapshot.content)?;
        controller.set_current_timestep(snapshot.timestep);
        debug!(
            timestep = snapshot.timestep,
            clusters = snapshot.content.clusters.len(),
            particles = snapshot.content.particles.len(),
            "snapshot restored"
        );
        Ok(controller)
    }
}

/// Write a snapshot to disk as a single JSON document.
pub fn save_simulation(
    path: &Path,
    serialized: &SerializedSimulation,
) -> Result<(), SnapshotError> {
    let body = serde_json::to_string(serialized).map_err(|source| SnapshotError::Malformed {
        section: "snapshot",
        source,
    })?;
    fs::write(path, body).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "snapshot written");
    Ok(())
}

/// Read a snapshot written by [`save_simulation`].
pub fn load_simulation(path: &Path) -> Result<SerializedSimulation, SnapshotError> {
    let body = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&body).map_err(|source| SnapshotError::Malformed {
        section: "snapshot",
        source,
    })
}

/// Render the statistics history as CSV, one sample per row.
#[must_use]
pub fn statistics_csv(history: &StatisticsHistory) -> String {
    let mut out = String::from(
        "timestep,clusters,cells,tokens,particles,cell_energy,token_energy,particle_energy\n",
    );
    for sample in history.iter() {
        append_csv_row(&mut out, sample);
    }
    out
}

fn append_csv_row(out: &mut String, sample: &RawStatistics) {
    use std::fmt::Write;
    let _ = writeln!(
        out,
        "{},{},{},{},{},{},{},{}",
        sample.timestep,
        sample.num_clusters,
        sample.num_cells,
        sample.num_tokens,
        sample.num_particles,
        sample.cell_energy,
        sample.token_energy,
        sample.particle_energy
    );
}

/// Export the statistics history of a run to a CSV file.
pub fn export_statistics_csv(
    path: &Path,
    history: &StatisticsHistory,
) -> Result<(), SnapshotError> {
    fs::write(path, statistics_csv(history)).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), samples = history.len(), "statistics exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellpond_core::{CellDescription, ClusterDescription, TokenDescription, Vector2};

    fn sample_content() -> DataDescription {
        let mut cluster = ClusterDescription::new(1);
        let mut cell = CellDescription::new(2)
            .with_pos(Vector2::new(10.0, 12.5))
            .with_energy(100.0)
            .with_branch_number(1);
        cell.add_token(TokenDescription {
            energy: 7.5,
            data: vec![3, 1, 4, 1, 5],
        });
        cluster.add_cell(cell);
        let mut data = DataDescription::default();
        data.add_cluster(cluster);
        data
    }

    fn sample_snapshot() -> SerializedSimulation {
        let mut symbols = SymbolTable::new();
        symbols.add_entry("ANCHOR", "[0]");
        Serializer::serialize_parts(
            42,
            &GeneralSettings::default(),
            &SimulationParameters::default(),
            &symbols,
            &sample_content(),
        )
        .expect("serialize")
    }

    #[test]
    fn snapshot_round_trips_structurally() {
        let serialized = sample_snapshot();
        let decoded = Serializer::deserialize(&serialized).expect("decode");
        assert_eq!(decoded.timestep, 42);
        assert_eq!(decoded.general, GeneralSettings::default());
        assert_eq!(decoded.parameters, SimulationParameters::default());
        assert_eq!(decoded.symbol_map.get("ANCHOR"), Some("[0]"));
        assert_eq!(decoded.content, sample_content());
    }

    #[test]
    fn canonical_snapshots_round_trip_byte_for_byte() {
        let serialized = sample_snapshot();
        let decoded = Serializer::deserialize(&serialized).expect("decode");
        let again = Serializer::serialize_parts(
            decoded.timestep,
            &decoded.general,
            &decoded.parameters,
            &decoded.symbol_map,
            &decoded.content,
        )
        .expect("re-serialize");
        assert_eq!(serialized, again);
    }

    #[test]
    fn version_mismatch_is_a_hard_error() {
        let mut serialized = sample_snapshot();
        serialized.timestep_and_settings = serialized
            .timestep_and_settings
            .replace("\"version\":1", "\"version\":9");
        assert!(matches!(
            Serializer::deserialize(&serialized),
            Err(SnapshotError::VersionMismatch {
                found: 9,
                expected: FORMAT_VERSION
            })
        ));
    }

    #[test]
    fn malformed_sections_name_the_section() {
        let mut serialized = sample_snapshot();
        serialized.content = "{not json".to_string();
        match Serializer::deserialize(&serialized) {
            Err(SnapshotError::Malformed { section, .. }) => assert_eq!(section, "content"),
            other => panic!("expected malformed content, got {other:?}"),
        }
    }

    #[test]
    fn restored_controller_matches_the_snapshot() {
        let serialized = sample_snapshot();
        let decoded = Serializer::deserialize(&serialized).expect("decode");
        let controller = Serializer::build_controller(&decoded).expect("restore");
        assert_eq!(controller.get_current_timestep(), 42);
        // Snapshot symbols are kept and the built-in defaults backfilled.
        assert_eq!(controller.get_symbol_table().get("ANCHOR"), Some("[0]"));
        assert!(controller.get_symbol_table().get("BRANCH_NUMBER").is_some());
        let data = controller.get_clustered_simulation_data();
        assert_eq!(data.clusters.len(), 1);
        // Token memory was normalized up to the configured size on load.
        let token = &data.clusters[0].cells.as_ref().unwrap()[0]
            .tokens
            .as_ref()
            .unwrap()[0];
        assert_eq!(
            token.data.len(),
            SimulationParameters::default().token_memory_size
        );
        assert_eq!(&token.data[..5], &[3, 1, 4, 1, 5]);
    }

    #[test]
    fn statistics_render_as_csv_rows() {
        let mut history = StatisticsHistory::new(8);
        history.push(RawStatistics {
            timestep: 1,
            num_clusters: 2,
            num_cells: 5,
            num_tokens: 1,
            num_particles: 3,
            cell_energy: 500.0,
            token_energy: 10.0,
            particle_energy: 12.5,
        });
        let csv = statistics_csv(&history);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestep,clusters,cells,tokens,particles,cell_energy,token_energy,particle_energy"
        );
        assert_eq!(lines.next().unwrap(), "1,2,5,1,3,500,10,12.5");
        assert!(lines.next().is_none());
    }

    #[test]
    fn snapshot_survives_a_disk_round_trip() {
        let serialized = sample_snapshot();
        let path = std::env::temp_dir().join(format!(
            "cellpond-snapshot-test-{}.json",
            std::process::id()
        ));
        save_simulation(&path, &serialized).expect("save");
        let loaded = load_simulation(&path).expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(serialized, loaded);
    }
}
