//! Reusable test scenarios for cluster simulation.
//!
//! Scenarios define common fault patterns and cluster configurations
//! that can be composed to create comprehensive tests. Durations are in
//! simulation rounds; one round ticks every node once and then delivers
//! messages until the network is idle.

/// Standard cluster sizes.
pub mod clusters {
    /// 3-node cluster.
    pub const THREE_NODE: u64 = 3;

    /// 5-node cluster for stronger fault tolerance.
    pub const FIVE_NODE: u64 = 5;
}

/// Common fault injection patterns.
pub mod faults {
    /// Leader isolation: partition the current leader from the rest of the
    /// cluster.
    #[derive(Debug, Clone, Copy)]
    pub struct LeaderIsolation {
        /// Rounds the partition lasts.
        pub rounds: usize,
    }

    /// Rolling restart: crash and restart each node one at a time.
    #[derive(Debug, Clone, Copy)]
    pub struct RollingRestart {
        /// Rounds a node stays down.
        pub down_rounds: usize,
    }

    /// Network flapping: rapidly alternate between partitioned and
    /// connected states.
    #[derive(Debug, Clone, Copy)]
    pub struct NetworkFlapping {
        /// Number of partition/heal cycles.
        pub cycles: usize,
        /// Rounds of each partition.
        pub partition_rounds: usize,
        /// Rounds of each heal.
        pub heal_rounds: usize,
    }

    /// Chaotic delivery probabilities.
    #[derive(Debug, Clone, Copy)]
    pub struct MessageChaos {
        /// Probability that a message is dropped.
        pub drop: f64,
        /// Probability that a message is delivered twice.
        pub duplicate: f64,
        /// Probability that a message overtakes the head of the queue.
        pub reorder: f64,
    }

    /// Moderate chaos: most messages arrive, some twice or out of order.
    pub const MODERATE_CHAOS: MessageChaos = MessageChaos {
        drop: 0.05,
        duplicate: 0.05,
        reorder: 0.20,
    };

    /// Heavy chaos: a lossy, noisy network.
    pub const HEAVY_CHAOS: MessageChaos = MessageChaos {
        drop: 0.20,
        duplicate: 0.15,
        reorder: 0.50,
    };
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard test seeds that have historically found bugs.
    pub const REGRESSION_SEEDS: &[u64] = &[
        42,
        12345,
        0xDEAD_BEEF,
        999,
        7777,
        0x1337,
        0xCAFE_BABE,
        1,
        u64::MAX,
        0,
    ];

    /// Number of sequential seeds swept by the randomized tests.
    pub const CI_SEED_COUNT: u64 = 50;
}
