//! End-to-end behavior of the compartmented simulation pipeline.

use cellpond_core::{
    communicator, CellDescription, CellFunction, ClusterDescription, CommunicatorState,
    ConnectionDescription, CoreError, DataDescription, GeneralSettings, ParticleDescription,
    SimulationController, SimulationParameters, TokenDescription, Vector2,
};

fn settings(seed: u64) -> GeneralSettings {
    GeneralSettings {
        world_width: 64,
        world_height: 64,
        compartment_cols: 2,
        compartment_rows: 2,
        rng_seed: Some(seed),
    }
}

/// Horizontal chain of bonded cells, one lattice unit apart, with branch
/// numbers increasing along the chain.
fn chain(
    cluster_id: u64,
    first_cell_id: u64,
    start_x: f64,
    y: f64,
    functions: Vec<CellFunction>,
) -> ClusterDescription {
    let n = functions.len();
    let mut cluster = ClusterDescription::new(cluster_id);
    for (i, function) in functions.into_iter().enumerate() {
        let id = first_cell_id + i as u64;
        let mut cell = CellDescription::new(id)
            .with_pos(Vector2::new(start_x + i as f64, y))
            .with_energy(100.0)
            .with_branch_number(i as u8)
            .with_function(function);
        let mut connections = Vec::new();
        if i > 0 {
            connections.push(ConnectionDescription {
                cell_id: id - 1,
                distance: 1.0,
                angle_from_previous: if i + 1 < n { 180.0 } else { 360.0 },
            });
        }
        if i + 1 < n {
            connections.push(ConnectionDescription {
                cell_id: id + 1,
                distance: 1.0,
                angle_from_previous: if i > 0 { 180.0 } else { 360.0 },
            });
        }
        cell.connections = Some(connections);
        cluster.add_cell(cell);
    }
    cluster
}

fn token_with(bytes: &[(usize, u8)]) -> TokenDescription {
    let mut data = vec![0u8; 64];
    for &(offset, value) in bytes {
        data[offset] = value;
    }
    TokenDescription { energy: 10.0, data }
}

fn listening(channel: u8) -> CellFunction {
    CellFunction::Communicator(CommunicatorState {
        listening_channel: channel,
        received: None,
    })
}

fn cell_of<'a>(data: &'a DataDescription, cluster_id: u64, cell_id: u64) -> &'a CellDescription {
    data.clusters
        .iter()
        .find(|c| c.id == cluster_id)
        .expect("cluster present")
        .cells
        .as_ref()
        .unwrap()
        .iter()
        .find(|c| c.id == cell_id)
        .expect("cell present")
}

#[test]
fn message_travels_from_sender_to_receiver_token() {
    let mut controller =
        SimulationController::new_simulation(settings(7), SimulationParameters::default())
            .expect("controller");

    // Sender: communicator at the chain head, Neutral partner to catch the
    // routed token so its sent counter stays inspectable.
    let mut sender = chain(
        1,
        2,
        20.0,
        10.0,
        vec![listening(0), CellFunction::Neutral],
    );
    sender.cells.as_mut().unwrap()[0]
        .tokens
        .get_or_insert_with(Vec::new)
        .push(token_with(&[
            (communicator::COMMAND, communicator::CMD_SEND_MESSAGE),
            (communicator::IN_CHANNEL, 5),
            (communicator::IN_MESSAGE, 42),
        ]));

    // Receiver chain: feeder carries a receive-programmed token that reaches
    // the communicator after one hop and moves on to the tail afterwards.
    let mut receiver = chain(
        5,
        10,
        30.0,
        10.0,
        vec![CellFunction::Neutral, listening(5), CellFunction::Neutral],
    );
    receiver.cells.as_mut().unwrap()[0]
        .tokens
        .get_or_insert_with(Vec::new)
        .push(token_with(&[(
            communicator::COMMAND,
            communicator::CMD_RECEIVE_MESSAGE,
        )]));

    let mut data = DataDescription::default();
    data.add_cluster(sender);
    data.add_cluster(receiver);
    controller
        .set_clustered_simulation_data(&data)
        .expect("load");

    controller.calc_timesteps(1).expect("first step");
    let after_send = controller.get_clustered_simulation_data();

    // The send token moved to the partner with its delivery count recorded.
    let partner = cell_of(&after_send, 1, 3);
    let tokens = partner.tokens.as_ref().unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].data[communicator::OUT_SENT_COUNT], 1);
    assert_eq!(tokens[0].data[0], 1);

    // The communicator's mailbox holds the message with the world-frame
    // bearing to the sender (due west, 180 degrees -> byte 128), distance 11.
    let hub = cell_of(&after_send, 5, 11);
    let Some(CellFunction::Communicator(state)) = &hub.function else {
        panic!("communicator function expected");
    };
    let msg = state.received.expect("message pending");
    assert_eq!(msg.channel, 5);
    assert_eq!(msg.message, 42);
    assert_eq!(msg.angle, 128);
    assert_eq!(msg.distance, 11);

    controller.calc_timesteps(1).expect("second step");
    let after_receive = controller.get_clustered_simulation_data();

    // The receive token executed on the communicator and hopped to the tail.
    let tail = cell_of(&after_receive, 5, 12);
    let tokens = tail.tokens.as_ref().unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(
        tokens[0].data[communicator::OUT_RECEIVED_NEW],
        communicator::OUT_NEW_MESSAGE
    );
    assert_eq!(tokens[0].data[communicator::OUT_RECEIVED_MESSAGE], 42);
    // The receive token came in from the feeder, so the sender lies exactly
    // behind its arrival edge.
    assert_eq!(tokens[0].data[communicator::OUT_RECEIVED_ANGLE], 0);
    assert_eq!(tokens[0].data[communicator::OUT_RECEIVED_DISTANCE], 11);

    // And the mailbox is clear again.
    let hub = cell_of(&after_receive, 5, 11);
    let Some(CellFunction::Communicator(state)) = &hub.function else {
        panic!("communicator function expected");
    };
    assert!(state.received.is_none());
}

#[test]
fn received_angle_is_relative_to_the_arrival_edge() {
    let mut controller =
        SimulationController::new_simulation(settings(7), SimulationParameters::default())
            .expect("controller");

    let mut sender = chain(1, 2, 20.0, 10.0, vec![listening(0), CellFunction::Neutral]);
    sender.cells.as_mut().unwrap()[0]
        .tokens
        .get_or_insert_with(Vec::new)
        .push(token_with(&[
            (communicator::COMMAND, communicator::CMD_SEND_MESSAGE),
            (communicator::IN_CHANNEL, 5),
            (communicator::IN_MESSAGE, 42),
        ]));

    // The hub's first listed bond points east to the tail, but the receive
    // token arrives along the second bond from the feeder to the south.
    let mut receiver = ClusterDescription::new(5);
    let mut feeder = CellDescription::new(10)
        .with_pos(Vector2::new(30.0, 11.0))
        .with_energy(100.0)
        .with_branch_number(0);
    feeder.connections = Some(vec![ConnectionDescription {
        cell_id: 11,
        distance: 1.0,
        angle_from_previous: 360.0,
    }]);
    feeder
        .tokens
        .get_or_insert_with(Vec::new)
        .push(token_with(&[(
            communicator::COMMAND,
            communicator::CMD_RECEIVE_MESSAGE,
        )]));
    let mut hub = CellDescription::new(11)
        .with_pos(Vector2::new(30.0, 10.0))
        .with_energy(100.0)
        .with_branch_number(1)
        .with_function(listening(5));
    hub.connections = Some(vec![
        ConnectionDescription {
            cell_id: 12,
            distance: 1.0,
            angle_from_previous: 90.0,
        },
        ConnectionDescription {
            cell_id: 10,
            distance: 1.0,
            angle_from_previous: 270.0,
        },
    ]);
    let mut tail = CellDescription::new(12)
        .with_pos(Vector2::new(31.0, 10.0))
        .with_energy(100.0)
        .with_branch_number(2);
    tail.connections = Some(vec![ConnectionDescription {
        cell_id: 11,
        distance: 1.0,
        angle_from_previous: 360.0,
    }]);
    receiver.add_cell(feeder);
    receiver.add_cell(hub);
    receiver.add_cell(tail);

    let mut data = DataDescription::default();
    data.add_cluster(sender);
    data.add_cluster(receiver);
    controller
        .set_clustered_simulation_data(&data)
        .expect("load");
    controller.calc_timesteps(2).expect("two steps");

    let out = controller.get_clustered_simulation_data();
    let tail = cell_of(&out, 5, 12);
    let tokens = tail.tokens.as_ref().unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(
        tokens[0].data[communicator::OUT_RECEIVED_NEW],
        communicator::OUT_NEW_MESSAGE
    );
    assert_eq!(tokens[0].data[communicator::OUT_RECEIVED_MESSAGE], 42);
    // Sender bearing 180 degrees, arrival edge bearing 90 degrees: the
    // message reads 90 degrees off the travel direction (byte 64), not the
    // 180 degrees the first-bond frame would give.
    assert_eq!(tokens[0].data[communicator::OUT_RECEIVED_ANGLE], 64);
    assert_eq!(tokens[0].data[communicator::OUT_RECEIVED_DISTANCE], 10);
}

#[test]
fn contended_mailbox_drops_the_second_message() {
    let mut controller =
        SimulationController::new_simulation(settings(7), SimulationParameters::default())
            .expect("controller");

    let mut first = chain(1, 100, 10.0, 10.0, vec![listening(0), CellFunction::Neutral]);
    first.cells.as_mut().unwrap()[0]
        .tokens
        .get_or_insert_with(Vec::new)
        .push(token_with(&[
            (communicator::COMMAND, communicator::CMD_SEND_MESSAGE),
            (communicator::IN_CHANNEL, 5),
            (communicator::IN_MESSAGE, 11),
        ]));
    let mut second = chain(3, 110, 10.0, 14.0, vec![listening(0), CellFunction::Neutral]);
    second.cells.as_mut().unwrap()[0]
        .tokens
        .get_or_insert_with(Vec::new)
        .push(token_with(&[
            (communicator::COMMAND, communicator::CMD_SEND_MESSAGE),
            (communicator::IN_CHANNEL, 5),
            (communicator::IN_MESSAGE, 22),
        ]));
    let mut target = ClusterDescription::new(7);
    target.add_cell(
        CellDescription::new(120)
            .with_pos(Vector2::new(14.0, 12.0))
            .with_energy(100.0)
            .with_function(listening(5)),
    );

    let mut data = DataDescription::default();
    data.add_cluster(first);
    data.add_cluster(second);
    data.add_cluster(target);
    controller
        .set_clustered_simulation_data(&data)
        .expect("load");
    controller.calc_timesteps(1).expect("step");

    let out = controller.get_clustered_simulation_data();
    let receiver = cell_of(&out, 7, 120);
    let Some(CellFunction::Communicator(state)) = &receiver.function else {
        panic!("communicator function expected");
    };
    // The earlier cluster wins; the later send finds the mailbox occupied.
    assert_eq!(state.received.expect("one message").message, 11);
    let winner = cell_of(&out, 1, 101);
    assert_eq!(
        winner.tokens.as_ref().unwrap()[0].data[communicator::OUT_SENT_COUNT],
        1
    );
    let loser = cell_of(&out, 3, 111);
    assert_eq!(
        loser.tokens.as_ref().unwrap()[0].data[communicator::OUT_SENT_COUNT],
        0
    );
}

#[test]
fn identical_seeds_produce_identical_runs() {
    let scene = {
        let mut data = DataDescription::default();
        data.add_cluster(chain(
            1,
            10,
            12.0,
            12.0,
            vec![listening(0), CellFunction::Neutral, CellFunction::EnergyGuidance],
        ));
        data.add_cluster(chain(
            2,
            20,
            44.0,
            50.0,
            vec![CellFunction::Neutral, CellFunction::Neutral],
        ));
        data.clusters[0].cells.as_mut().unwrap()[0]
            .tokens
            .get_or_insert_with(Vec::new)
            .push(token_with(&[
                (communicator::COMMAND, communicator::CMD_SEND_MESSAGE),
                (communicator::IN_CHANNEL, 3),
            ]));
        data.add_particle(ParticleDescription {
            id: 200,
            pos: Some(Vector2::new(40.0, 40.0)),
            vel: Some(Vector2::new(0.7, 0.3)),
            energy: Some(5.0),
        });
        data.add_particle(ParticleDescription {
            id: 201,
            pos: Some(Vector2::new(50.0, 20.0)),
            vel: Some(Vector2::new(-0.5, 0.2)),
            energy: Some(8.0),
        });
        data
    };

    let run = |seed: u64| {
        let mut controller =
            SimulationController::new_simulation(settings(seed), SimulationParameters::default())
                .expect("controller");
        controller
            .set_clustered_simulation_data(&scene)
            .expect("load");
        controller.calc_timesteps(15).expect("steps");
        controller.validate().expect("invariants survive stepping");
        (
            controller.get_clustered_simulation_data(),
            controller.get_raw_statistics(),
        )
    };

    let (data_a, stats_a) = run(42);
    let (data_b, stats_b) = run(42);
    assert_eq!(data_a, data_b);
    assert_eq!(stats_a, stats_b);
    assert_eq!(stats_a.timestep, 15);
}

#[test]
fn particle_wraps_across_the_world_seam() {
    let mut controller =
        SimulationController::new_simulation(settings(3), SimulationParameters::default())
            .expect("controller");
    let mut data = DataDescription::default();
    data.add_particle(ParticleDescription {
        id: 9,
        pos: Some(Vector2::new(63.5, 10.0)),
        vel: Some(Vector2::new(1.0, 0.0)),
        energy: Some(4.0),
    });
    controller
        .set_clustered_simulation_data(&data)
        .expect("load");
    controller.calc_timesteps(1).expect("step");

    let out = controller.get_clustered_simulation_data();
    assert_eq!(out.particles.len(), 1);
    let particle = &out.particles[0];
    assert_eq!(particle.id, 9);
    let pos = particle.pos.unwrap();
    // Heading jitter stays within two degrees, so the crossing is tight.
    assert!(pos.x < 1.0, "wrapped x, got {}", pos.x);
    assert!((pos.y - 10.0).abs() < 0.1);
    assert!((particle.energy.unwrap() - 4.0).abs() < 1e-12);
}

#[test]
fn broken_bond_mirroring_is_rejected_on_load() {
    let mut controller =
        SimulationController::new_simulation(settings(3), SimulationParameters::default())
            .expect("controller");
    let mut cluster = ClusterDescription::new(1);
    let mut a = CellDescription::new(2)
        .with_pos(Vector2::new(5.0, 5.0))
        .with_energy(100.0);
    a.connections = Some(vec![ConnectionDescription {
        cell_id: 3,
        distance: 1.0,
        angle_from_previous: 360.0,
    }]);
    let b = CellDescription::new(3)
        .with_pos(Vector2::new(6.0, 5.0))
        .with_energy(100.0);
    cluster.add_cell(a);
    cluster.add_cell(b);
    let mut data = DataDescription::default();
    data.add_cluster(cluster);

    assert!(matches!(
        controller.set_clustered_simulation_data(&data),
        Err(CoreError::UnmirroredBond(..))
    ));
}
