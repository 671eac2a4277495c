//! Keel Tests - Deterministic Simulation Testing for keel.
//!
//! This crate drives whole clusters of [`keel_raft::RawNode`]s over a
//! seeded, fault-injecting network and checks Raft safety properties along
//! the way. Tests are organized by component and type:
//!
//! ## Test Organization
//!
//! **Simulation Tests** (`simulation_tests`): randomized runs with message
//! chaos, partitions and crashes, checked by the `PropertyChecker`
//!
//! **Integration Tests** (`*_tests.rs`): end-to-end behavior through the
//! public API
//! - `raft_tests`: elections, replication, commit rules, reads
//! - `confchange_tests`: joint consensus and membership changes
//! - `progress_tests`: flow control and quorum arithmetic
//!
//! **Support Modules**:
//! - `network`: seeded message network with drop/duplicate/reorder faults
//! - `cluster`: `SimCluster`, a synchronous driver for a group of replicas
//! - `properties`: property definitions (`SingleLeaderPerTerm`, `LogMatching`, etc.)
//! - `scenarios`: reusable cluster sizes, fault patterns and seeds
//!
//! ## Naming Conventions
//!
//! - Simulation tests: `test_sim_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod cluster;
pub mod network;
pub mod properties;
pub mod scenarios;

// Simulation test modules (deterministic simulation with fault injection).
#[cfg(test)]
mod simulation_tests;


static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process. The level
/// comes from `RUST_LOG` and defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // Another harness may have installed a subscriber already.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
