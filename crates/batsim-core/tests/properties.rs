//! Whole-run properties over random topologies.

use batsim_core::prelude::*;

fn random_config(seed: u64) -> RunConfig {
    RunConfig::default()
        .with_seed(seed)
        .with_node_num(15)
        .with_rates(0.1, 0.3)
        .with_stop_time(30.0)
        .with_snapshots(5.0)
}

#[test]
fn test_same_seed_same_result() {
    let first = run_simulation(random_config(11)).expect("first run failed");
    let second = run_simulation(random_config(11)).expect("second run failed");

    let a = serde_json::to_string(&first).expect("failed to serialize");
    let b = serde_json::to_string(&second).expect("failed to serialize");
    assert_eq!(a, b, "identical seeds must produce identical results");
}

#[test]
fn test_seed_changes_topology() {
    let a = SimulationRun::build(random_config(1)).unwrap();
    let b = SimulationRun::build(random_config(2)).unwrap();
    let positions = |run: &SimulationRun| {
        run.node_ips()
            .map(|ip| run.node(ip).unwrap().position())
            .collect::<Vec<_>>()
    };
    assert_ne!(positions(&a), positions(&b));
}

#[test]
fn test_virtual_time_never_decreases() {
    let mut run = SimulationRun::build(random_config(5)).unwrap();
    let mut last = 0.0;
    let mut steps = 0;
    while let Some(t) = run.step().unwrap() {
        assert!(t >= last, "time went back from {} to {}", last, t);
        last = t;
        steps += 1;
    }
    assert!(steps > 0);
    assert_eq!(run.events_processed(), steps);
    assert_eq!(run.pending_events(), 0);
}

#[test]
fn test_received_never_exceeds_sent() {
    for seed in [3, 8, 21] {
        let result = run_simulation(random_config(seed)).unwrap();
        assert!(result.total_rx_bytes() <= result.total_tx_bytes(), "seed {}", seed);
        assert_eq!(result.selfish.nodes + result.cooperative.nodes, 15);
        assert!(result.stats.packets_delivered <= result.stats.packets_created);
    }
}

#[test]
fn test_lossless_cooperative_line_delivers_everything() {
    let config = RunConfig::default()
        .with_stop_time(50.0)
        .with_channel(ChannelConfig::default().with_error_model(ErrorModel::LinkProbability))
        .with_reputation(1000.0, 5);
    let mut run = SimulationRun::new(config).unwrap();
    for ip in 1..=4 {
        run.add_node(ip, NodePosition::new(ip as f64 * 20.0, 0.0), false).unwrap();
    }
    for ip in 1..4 {
        run.connect(ip, ip + 1, 1.0, 0.01).unwrap();
    }
    run.add_flow(1, 4, FlowDirection::Bidirectional).unwrap();
    run.add_flow(2, 3, FlowDirection::Bidirectional).unwrap();
    let result = run.run().unwrap();

    assert!(result.total_tx_bytes() > 0);
    assert_eq!(result.total_rx_bytes(), result.total_tx_bytes());
    assert_eq!(result.stats.total_dropped(), 0);
}

#[test]
fn test_drop_score_bounded_by_selfish_drops() {
    for seed in [4, 9] {
        let result = run_simulation(random_config(seed).with_reputation(3.0, 2)).unwrap();
        for node in &result.nodes {
            assert!(
                node.drop_score as u64 <= node.dropped_selfish,
                "node {} score {} over {} refusals",
                node.ip,
                node.drop_score,
                node.dropped_selfish
            );
        }
    }
}

#[test]
fn test_selfish_nodes_never_relay_without_flips() {
    let config = random_config(17).with_rates(0.2, 0.4).with_reputation(1000.0, 5);
    let selfish: Vec<_> = {
        let run = SimulationRun::build(config.clone()).unwrap();
        run.node_ips().filter(|ip| run.node(*ip).unwrap().selfish).collect()
    };
    assert!(!selfish.is_empty());

    let mut run = SimulationRun::build(config).unwrap().with_delivery_log();
    run.run().unwrap();
    let deliveries = run.deliveries().unwrap();
    assert!(!deliveries.is_empty());
    for record in deliveries {
        for relay in &record.path[1..] {
            assert!(!selfish.contains(relay), "selfish node {} relayed packet {}", relay, record.packet);
        }
    }
}

#[test]
fn test_snapshots_follow_interval() {
    let result = run_simulation(random_config(6)).unwrap();
    let times: Vec<f64> = result.snapshots.iter().map(|s| s.time).collect();
    assert_eq!(times, vec![5.0, 10.0, 15.0, 20.0, 25.0, 30.0]);
    for snapshot in &result.snapshots {
        assert_eq!(snapshot.selfish.nodes + snapshot.cooperative.nodes, 15);
    }
}

#[test]
fn test_early_stop_when_selfish_count_settles() {
    // No reputation ticks, so the selfish count never moves.
    let config = random_config(6)
        .with_reputation(1000.0, 5)
        .with_snapshots(1.0)
        .with_early_stop(3, 0.0);
    let result = run_simulation(config).unwrap();

    assert!(result.stats.early_stopped);
    assert_eq!(result.snapshots.len(), 3);
    assert_eq!(result.stats.end_time, 3.0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = RunConfig::default().with_rates(0.1, 1.5);
    assert!(matches!(run_simulation(config), Err(SimError::InvalidConfig(_))));

    let config = RunConfig::default().with_early_stop(3, 0.0);
    assert!(matches!(SimulationRun::new(config), Err(SimError::InvalidConfig(_))));
}

#[test]
fn test_config_from_partial_json() {
    let config: RunConfig = serde_json::from_str(r#"{"seed": 7, "node_num": 30}"#).unwrap();
    assert_eq!(config.seed, 7);
    assert_eq!(config.node_num, 30);
    assert_eq!(config.stop_time, RunConfig::default().stop_time);
    assert!(config.validate().is_ok());
}

#[test]
fn test_dense_flows_get_ports_on_every_node() {
    // 100 nodes with a flow per ordered pair: 9,900 flows.
    let run = SimulationRun::build(RunConfig::default().with_node_num(100).with_rates(1.0, 0.3))
        .expect("dense flow layout should build");
    assert_eq!(run.endpoints().len(), 2 * 9_900);

    let mut bound: Vec<(u32, u16)> = run
        .endpoints()
        .iter()
        .map(|&id| {
            let app = run.endpoint(id).unwrap();
            (app.local_ip, app.local_port)
        })
        .collect();
    bound.sort();
    bound.dedup();
    assert_eq!(bound.len(), 2 * 9_900, "every endpoint needs its own (ip, port)");
}

#[test]
fn test_isolated_nodes_drop_everything_as_no_path() {
    let config = random_config(2).with_area(1000.0, 1.0);
    let result = run_simulation(config).unwrap();

    assert!(result.stats.packets_created > 0);
    assert_eq!(result.total_rx_bytes(), 0);
    assert_eq!(result.stats.dropped(DropReason::NoPath), result.stats.packets_created);
}
