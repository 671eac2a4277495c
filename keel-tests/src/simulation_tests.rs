//! Deterministic simulation tests.
//!
//! Each test drives a `SimCluster` through a fault schedule chosen by its
//! seed, records every node's state after each delivered message, and
//! asserts the Raft safety properties at the end. Once the faults stop the
//! cluster must also converge: one leader, and every replica applying the
//! same entries.

use keel_core::NodeId;
use keel_raft::{RaftConfig, StateRole};

use crate::cluster::SimCluster;
use crate::init_tracing;
use crate::network::{ChaoticNetwork, NetworkMode};
use crate::properties::{assert_no_violations, PropertyChecker};
use crate::scenarios::clusters::{FIVE_NODE, THREE_NODE};
use crate::scenarios::faults::{
    LeaderIsolation, MessageChaos, NetworkFlapping, RollingRestart, HEAVY_CHAOS, MODERATE_CHAOS,
};
use crate::scenarios::seeds::{CI_SEED_COUNT, REGRESSION_SEEDS};

/// Bound on deliveries per round, so a storm of duplicates cannot hang a
/// test.
const MAX_DELIVERIES_PER_ROUND: usize = 10_000;

/// Rounds allowed for the cluster to settle once the faults stop.
const CONVERGENCE_ROUNDS: usize = 100;

const PAYLOADS: [&[u8]; 8] = [b"v0", b"v1", b"v2", b"v3", b"v4", b"v5", b"v6", b"v7"];

fn chaotic_cluster(
    n: u64,
    seed: u64,
    chaos: MessageChaos,
    configure: impl Fn(RaftConfig) -> RaftConfig,
) -> SimCluster {
    let mut cluster = SimCluster::with_config(n, seed, NetworkMode::Chaotic, configure);
    *cluster.network_mut() = ChaoticNetwork::new(seed, NetworkMode::Chaotic).with_chaos(
        chaos.drop,
        chaos.duplicate,
        chaos.reorder,
    );
    cluster
}

/// Ticks every node once and delivers until idle, observing the cluster
/// after each message.
fn round(cluster: &mut SimCluster, checker: &mut PropertyChecker) {
    cluster.tick_all();
    checker.record_state(cluster);
    for _ in 0..MAX_DELIVERIES_PER_ROUND {
        if !cluster.deliver_one() {
            return;
        }
        checker.record_state(cluster);
    }
}

/// Proposes the `n`th payload on the current leader, if there is one.
/// Proposals may be dropped; the outcome is not checked here.
fn propose_on_leader(cluster: &mut SimCluster, n: usize) {
    if let Some(leader) = cluster.leader() {
        let _ = cluster.propose(leader.get(), PAYLOADS[n % PAYLOADS.len()]);
    }
}

/// Removes every fault and runs until the cluster settles, then asserts
/// that every replica applied the same log.
fn converge(cluster: &mut SimCluster, checker: &mut PropertyChecker, seed: u64) {
    cluster.network_mut().set_mode(NetworkMode::Reliable);
    cluster.heal();
    for id in cluster.ids() {
        if cluster.node(id.get()).is_crashed() {
            cluster.restart(id.get());
        }
    }

    let mut settled = false;
    for _ in 0..CONVERGENCE_ROUNDS {
        round(cluster, checker);
        if is_settled(cluster) {
            settled = true;
            break;
        }
    }
    assert!(settled, "seed {seed}: cluster did not converge");

    let mut nodes = cluster.nodes();
    let first = nodes.next().expect("cluster has nodes");
    for node in nodes {
        assert_eq!(
            node.applied_index(),
            first.applied_index(),
            "seed {seed}: node {} applied a different prefix",
            node.id()
        );
        assert_eq!(
            node.applied_data(),
            first.applied_data(),
            "seed {seed}: node {} applied different entries",
            node.id()
        );
    }
    assert!(
        checker.committed_count() > 0,
        "seed {seed}: nothing committed"
    );
    assert_no_violations(checker, cluster, seed);
}

fn is_settled(cluster: &SimCluster) -> bool {
    let Some(leader) = cluster.leader() else {
        return false;
    };
    let leader = cluster.node(leader.get());
    let committed = leader.committed();
    let followers = cluster
        .nodes()
        .filter(|n| n.id() != leader.id())
        .all(|n| n.state() == StateRole::Follower);
    let caught_up = cluster.nodes().all(|n| n.applied_index() == committed);
    committed == leader.last_index() && followers && caught_up
}

/// Runs `rounds` rounds of chaotic delivery with a proposal every third
/// round.
fn run_chaos(cluster: &mut SimCluster, checker: &mut PropertyChecker, rounds: usize) {
    for r in 0..rounds {
        if r % 3 == 0 {
            propose_on_leader(cluster, r);
        }
        round(cluster, checker);
    }
}

#[test]
fn test_sim_regression_seeds_moderate_chaos() {
    init_tracing();
    for &seed in REGRESSION_SEEDS {
        let mut cluster = chaotic_cluster(THREE_NODE, seed, MODERATE_CHAOS, |c| c);
        let mut checker = PropertyChecker::new();

        run_chaos(&mut cluster, &mut checker, 150);
        assert!(checker.terms_with_leader() > 0, "seed {seed}: no leader");
        converge(&mut cluster, &mut checker, seed);
    }
}

#[test]
fn test_sim_seed_sweep_five_nodes() {
    init_tracing();
    for seed in 0..CI_SEED_COUNT {
        let mut cluster = chaotic_cluster(FIVE_NODE, seed, MODERATE_CHAOS, |c| c);
        let mut checker = PropertyChecker::new();

        run_chaos(&mut cluster, &mut checker, 60);
        converge(&mut cluster, &mut checker, seed);
    }
}

#[test]
fn test_sim_heavy_chaos_with_pre_vote_and_check_quorum() {
    init_tracing();
    for &seed in REGRESSION_SEEDS {
        let mut cluster = chaotic_cluster(FIVE_NODE, seed, HEAVY_CHAOS, |c| {
            c.with_pre_vote(true).with_check_quorum(true)
        });
        let mut checker = PropertyChecker::new();

        run_chaos(&mut cluster, &mut checker, 200);
        converge(&mut cluster, &mut checker, seed);
    }
}

#[test]
fn test_sim_leader_isolation() {
    init_tracing();
    let isolation = LeaderIsolation { rounds: 30 };
    for &seed in REGRESSION_SEEDS {
        let mut cluster = SimCluster::new(THREE_NODE, seed);
        let mut checker = PropertyChecker::new();

        let old = cluster.wait_for_leader(100).expect("initial leader");
        cluster.propose(old.get(), b"before").unwrap();
        round(&mut cluster, &mut checker);

        cluster.partition(&[old.get()]);
        // Accepted by the isolated leader, but it can never commit.
        cluster.propose(old.get(), b"isolated").unwrap();
        let stuck_at = cluster.node(old.get()).committed();
        for _ in 0..isolation.rounds {
            round(&mut cluster, &mut checker);
        }
        let mut new_leader = None;
        for _ in 0..100 {
            new_leader = cluster
                .nodes()
                .find(|n| n.id() != old && n.state() == StateRole::Leader)
                .map(|n| n.id());
            if new_leader.is_some() {
                break;
            }
            round(&mut cluster, &mut checker);
        }
        let new_leader = new_leader.expect("majority side elects a leader");
        assert_eq!(cluster.node(old.get()).committed(), stuck_at, "seed {seed}");
        cluster.propose(new_leader.get(), b"majority").unwrap();

        converge(&mut cluster, &mut checker, seed);
        assert_eq!(cluster.leader(), Some(new_leader), "seed {seed}");
        for node in cluster.nodes() {
            let data = node.applied_data();
            assert!(data.iter().any(|d| &d[..] == b"before"), "seed {seed}");
            assert!(data.iter().any(|d| &d[..] == b"majority"), "seed {seed}");
            assert!(
                data.iter().all(|d| &d[..] != b"isolated"),
                "seed {seed}: node {} applied an uncommittable entry",
                node.id()
            );
        }
    }
}

#[test]
fn test_sim_rolling_restart() {
    init_tracing();
    let restart = RollingRestart { down_rounds: 15 };
    for &seed in REGRESSION_SEEDS {
        let mut cluster = SimCluster::new(FIVE_NODE, seed);
        let mut checker = PropertyChecker::new();
        cluster.wait_for_leader(100).expect("initial leader");

        let mut proposals = 0;
        for id in cluster.ids() {
            cluster.crash(id.get());
            for _ in 0..restart.down_rounds {
                propose_on_leader(&mut cluster, proposals);
                proposals += 1;
                round(&mut cluster, &mut checker);
            }
            cluster.restart(id.get());
            for _ in 0..restart.down_rounds {
                round(&mut cluster, &mut checker);
            }
        }

        converge(&mut cluster, &mut checker, seed);
        // One node down at a time never costs a five node cluster its
        // quorum, so most proposals made it.
        let applied = cluster.node(1).applied_data().len();
        assert!(applied > 0, "seed {seed}: nothing applied");
    }
}

#[test]
fn test_sim_network_flapping() {
    init_tracing();
    let flapping = NetworkFlapping {
        cycles: 6,
        partition_rounds: 12,
        heal_rounds: 8,
    };
    for &seed in REGRESSION_SEEDS {
        let mut cluster =
            chaotic_cluster(FIVE_NODE, seed, MODERATE_CHAOS, |c| c.with_pre_vote(true));
        let mut checker = PropertyChecker::new();
        let n = cluster.ids().len();

        let mut proposals = 0;
        for _ in 0..flapping.cycles {
            // Cut off a random minority, sometimes including the leader.
            let size = 1 + cluster.network_mut().gen_range(0..2);
            let side: Vec<u64> = (0..size)
                .map(|_| 1 + cluster.network_mut().gen_range(0..n) as u64)
                .collect();
            cluster.partition(&side);
            for _ in 0..flapping.partition_rounds {
                propose_on_leader(&mut cluster, proposals);
                proposals += 1;
                round(&mut cluster, &mut checker);
            }
            cluster.heal();
            for _ in 0..flapping.heal_rounds {
                round(&mut cluster, &mut checker);
            }
        }

        converge(&mut cluster, &mut checker, seed);
    }
}

#[test]
fn test_sim_crashes_under_chaos() {
    init_tracing();
    for seed in 0..CI_SEED_COUNT / 5 {
        let mut cluster = chaotic_cluster(FIVE_NODE, seed, MODERATE_CHAOS, |c| c);
        let mut checker = PropertyChecker::new();
        let n = cluster.ids().len();

        for r in 0..200 {
            if r % 3 == 0 {
                propose_on_leader(&mut cluster, r);
            }
            if r % 25 == 0 {
                let victim = 1 + cluster.network_mut().gen_range(0..n) as u64;
                if cluster.node(victim).is_crashed() {
                    cluster.restart(victim);
                } else {
                    cluster.crash(victim);
                }
            }
            round(&mut cluster, &mut checker);
        }

        converge(&mut cluster, &mut checker, seed);
    }
}

#[test]
fn test_sim_same_seed_same_outcome() {
    init_tracing();
    let run = |seed: u64| {
        let mut cluster = chaotic_cluster(THREE_NODE, seed, HEAVY_CHAOS, |c| c);
        let mut checker = PropertyChecker::new();
        run_chaos(&mut cluster, &mut checker, 80);
        let nodes: Vec<(NodeId, u64, u64, u64)> = cluster
            .nodes()
            .map(|n| (n.id(), n.term(), n.committed(), n.last_index()))
            .collect();
        (nodes, cluster.network_mut().stats())
    };
    for &seed in &REGRESSION_SEEDS[..3] {
        assert_eq!(run(seed), run(seed), "seed {seed}");
    }
}
