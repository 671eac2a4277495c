//! Helpers shared by unit tests.

use std::mem;
use std::sync::Once;

use keel_core::NodeId;

use crate::config::RaftConfig;
use crate::message::{ConfState, Entry, Message};
use crate::state::Raft;
use crate::storage::MemoryStorage;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn nid(id: u64) -> NodeId {
    NodeId::new(id)
}

pub(crate) fn new_storage(voters: &[u64]) -> MemoryStorage {
    MemoryStorage::new_with_conf_state(ConfState::with_voters(voters.iter().copied()))
}

pub(crate) fn new_config(id: u64, election: usize, heartbeat: usize) -> RaftConfig {
    RaftConfig::new(nid(id))
        .with_ticks(election, heartbeat)
        .with_max_inflight(256, 0)
}

pub(crate) fn new_test_raft(
    id: u64,
    voters: &[u64],
    election: usize,
    heartbeat: usize,
) -> Raft<MemoryStorage> {
    new_test_raft_with_config(&new_config(id, election, heartbeat), new_storage(voters))
}

pub(crate) fn new_test_raft_with_config(
    config: &RaftConfig,
    storage: MemoryStorage,
) -> Raft<MemoryStorage> {
    init_tracing();
    Raft::new(config, storage).expect("valid test raft")
}

/// Persists everything unstable, then releases the messages that were
/// waiting on it. Self-addressed responses are stepped; the rest join
/// `msgs`.
pub(crate) fn persist(r: &mut Raft<MemoryStorage>) {
    if let Some(snapshot) = r.raft_log.next_unstable_snapshot().cloned() {
        r.raft_log
            .store
            .wl()
            .apply_snapshot(snapshot.clone())
            .expect("apply snapshot");
        r.applied_snap(&snapshot);
    }
    let unstable: Vec<Entry> = r.raft_log.next_unstable_ents().to_vec();
    if let Some(last) = unstable.last() {
        r.raft_log.store.wl().append(&unstable);
        r.raft_log.stable_to(last.index, last.term);
    }
    r.raft_log.store.wl().set_hard_state(r.hard_state());

    for m in mem::take(&mut r.msgs_after_append) {
        if m.to == r.id {
            r.step(m).expect("step self message");
        } else {
            r.msgs.push(m);
        }
    }
}

/// Persists, then drains every outbound message.
pub(crate) fn read_messages(r: &mut Raft<MemoryStorage>) -> Vec<Message> {
    persist(r);
    mem::take(&mut r.msgs)
}

/// Builds a message carrying the given term.
pub(crate) fn msg(
    msg_type: crate::message::MessageType,
    from: u64,
    to: u64,
    term: u64,
) -> Message {
    let mut m = Message::new(msg_type, nid(from), nid(to));
    m.term = term;
    m
}
