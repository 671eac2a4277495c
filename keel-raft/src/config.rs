//! Replica configuration.

use keel_core::NodeId;

use crate::error::{RaftError, RaftResult};
use crate::limits::{
    ELECTION_TICK_DEFAULT, HEARTBEAT_TICK_DEFAULT, MAX_INFLIGHT_MSGS_DEFAULT,
    MAX_SIZE_PER_MSG_DEFAULT, NO_LIMIT,
};
use crate::read_only::ReadOnlyOption;

/// Configuration for a Raft replica.
///
/// Built with [`RaftConfig::new`] and the chained `with_*` setters, then
/// checked with [`RaftConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    /// This replica's ID. Must not be `NONE` or a local thread ID.
    pub id: NodeId,

    /// Ticks without hearing from a leader before campaigning. Must exceed
    /// `heartbeat_tick`; ten times is a sensible ratio.
    pub election_tick: usize,

    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,

    /// Last applied index. Only set when restarting; entries at or below it
    /// are not handed out again.
    pub applied: u64,

    /// Persist and apply through `StorageAppend`/`StorageApply` messages
    /// instead of the ready/advance cycle.
    pub async_storage_writes: bool,

    /// Byte limit of each append message. 0 sends at most one entry.
    pub max_size_per_msg: u64,

    /// Byte limit of committed entries being applied at once. 0 means no
    /// limit.
    pub max_committed_size_per_ready: u64,

    /// Byte limit of the uncommitted tail on the leader; proposals beyond
    /// it are dropped. 0 means no limit.
    pub max_uncommitted_entries_size: u64,

    /// Unacknowledged append messages per peer while replicating.
    pub max_inflight_msgs: usize,

    /// Unacknowledged append bytes per peer. 0 means no limit.
    pub max_inflight_bytes: u64,

    /// Step down when a quorum has not been heard from for an election
    /// timeout.
    pub check_quorum: bool,

    /// Run a non-binding pre-vote round before incrementing the term.
    pub pre_vote: bool,

    /// How read-only requests are served.
    pub read_only_option: ReadOnlyOption,

    /// Followers drop proposals instead of forwarding them to the leader.
    pub disable_proposal_forwarding: bool,

    /// Skip propose-time validation of configuration changes.
    pub disable_conf_change_validation: bool,

    /// Step down when removed from the group or demoted to learner.
    pub step_down_on_removal: bool,

    /// Seed for election timeout randomization. Defaults to the ID.
    pub random_seed: Option<u64>,
}

impl RaftConfig {
    /// Creates a configuration with default limits.
    #[must_use]
    pub const fn new(id: NodeId) -> Self {
        Self {
            id,
            election_tick: ELECTION_TICK_DEFAULT,
            heartbeat_tick: HEARTBEAT_TICK_DEFAULT,
            applied: 0,
            async_storage_writes: false,
            max_size_per_msg: MAX_SIZE_PER_MSG_DEFAULT,
            max_committed_size_per_ready: 0,
            max_uncommitted_entries_size: 0,
            max_inflight_msgs: MAX_INFLIGHT_MSGS_DEFAULT,
            max_inflight_bytes: 0,
            check_quorum: false,
            pre_vote: false,
            read_only_option: ReadOnlyOption::Safe,
            disable_proposal_forwarding: false,
            disable_conf_change_validation: false,
            step_down_on_removal: false,
            random_seed: None,
        }
    }

    /// Sets the election and heartbeat ticks.
    #[must_use]
    pub const fn with_ticks(mut self, election_tick: usize, heartbeat_tick: usize) -> Self {
        self.election_tick = election_tick;
        self.heartbeat_tick = heartbeat_tick;
        self
    }

    /// Sets the last applied index.
    #[must_use]
    pub const fn with_applied(mut self, applied: u64) -> Self {
        self.applied = applied;
        self
    }

    /// Enables asynchronous storage writes.
    #[must_use]
    pub const fn with_async_storage_writes(mut self, enabled: bool) -> Self {
        self.async_storage_writes = enabled;
        self
    }

    /// Sets the byte limit of each append message.
    #[must_use]
    pub const fn with_max_size_per_msg(mut self, bytes: u64) -> Self {
        self.max_size_per_msg = bytes;
        self
    }

    /// Sets the byte limit of committed entries being applied.
    #[must_use]
    pub const fn with_max_committed_size_per_ready(mut self, bytes: u64) -> Self {
        self.max_committed_size_per_ready = bytes;
        self
    }

    /// Sets the byte limit of the uncommitted tail.
    #[must_use]
    pub const fn with_max_uncommitted_entries_size(mut self, bytes: u64) -> Self {
        self.max_uncommitted_entries_size = bytes;
        self
    }

    /// Sets the inflight window per peer.
    #[must_use]
    pub const fn with_max_inflight(mut self, msgs: usize, bytes: u64) -> Self {
        self.max_inflight_msgs = msgs;
        self.max_inflight_bytes = bytes;
        self
    }

    /// Enables check-quorum.
    #[must_use]
    pub const fn with_check_quorum(mut self, enabled: bool) -> Self {
        self.check_quorum = enabled;
        self
    }

    /// Enables pre-vote.
    #[must_use]
    pub const fn with_pre_vote(mut self, enabled: bool) -> Self {
        self.pre_vote = enabled;
        self
    }

    /// Sets how read-only requests are served.
    #[must_use]
    pub const fn with_read_only_option(mut self, option: ReadOnlyOption) -> Self {
        self.read_only_option = option;
        self
    }

    /// Disables proposal forwarding on followers.
    #[must_use]
    pub const fn with_disable_proposal_forwarding(mut self, disabled: bool) -> Self {
        self.disable_proposal_forwarding = disabled;
        self
    }

    /// Disables propose-time conf change validation.
    #[must_use]
    pub const fn with_disable_conf_change_validation(mut self, disabled: bool) -> Self {
        self.disable_conf_change_validation = disabled;
        self
    }

    /// Makes the leader step down when removed or demoted.
    #[must_use]
    pub const fn with_step_down_on_removal(mut self, enabled: bool) -> Self {
        self.step_down_on_removal = enabled;
        self
    }

    /// Seeds election timeout randomization.
    #[must_use]
    pub const fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> RaftResult<()> {
        let reason = if self.id.is_none() {
            "cannot use none as id"
        } else if self.id.is_local_thread() {
            "cannot use local target as id"
        } else if self.heartbeat_tick == 0 {
            "heartbeat tick must be greater than 0"
        } else if self.election_tick <= self.heartbeat_tick {
            "election tick must be greater than heartbeat tick"
        } else if self.max_inflight_msgs == 0 {
            "max inflight messages must be greater than 0"
        } else if self.max_inflight_bytes != 0 && self.max_inflight_bytes < self.max_size_per_msg {
            "max inflight bytes must be >= max message size"
        } else if self.read_only_option == ReadOnlyOption::LeaseBased && !self.check_quorum {
            "check quorum must be enabled when read only option is lease based"
        } else {
            return Ok(());
        };
        Err(RaftError::InvalidConfig { reason })
    }

    /// Uncommitted tail budget with 0 mapped to no limit.
    #[must_use]
    pub const fn uncommitted_size_limit(&self) -> u64 {
        or_no_limit(self.max_uncommitted_entries_size)
    }

    /// Inflight byte budget with 0 mapped to no limit.
    #[must_use]
    pub const fn inflight_bytes_limit(&self) -> u64 {
        or_no_limit(self.max_inflight_bytes)
    }

    /// Applying byte budget with 0 mapped to no limit.
    #[must_use]
    pub const fn committed_size_per_ready_limit(&self) -> u64 {
        or_no_limit(self.max_committed_size_per_ready)
    }
}

const fn or_no_limit(value: u64) -> u64 {
    if value == 0 {
        NO_LIMIT
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_reason(config: &RaftConfig) -> &'static str {
        match config.validate() {
            Err(RaftError::InvalidConfig { reason }) => reason,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RaftConfig::new(NodeId::new(1));
        assert!(config.validate().is_ok());
        assert_eq!(config.uncommitted_size_limit(), NO_LIMIT);
        assert_eq!(config.inflight_bytes_limit(), NO_LIMIT);
        assert_eq!(config.committed_size_per_ready_limit(), NO_LIMIT);
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        assert_eq!(
            invalid_reason(&RaftConfig::new(NodeId::NONE)),
            "cannot use none as id"
        );
        assert_eq!(
            invalid_reason(&RaftConfig::new(NodeId::LOCAL_APPEND_THREAD)),
            "cannot use local target as id"
        );
    }

    #[test]
    fn test_validate_rejects_bad_ticks() {
        let id = NodeId::new(1);
        assert_eq!(
            invalid_reason(&RaftConfig::new(id).with_ticks(10, 0)),
            "heartbeat tick must be greater than 0"
        );
        assert_eq!(
            invalid_reason(&RaftConfig::new(id).with_ticks(3, 3)),
            "election tick must be greater than heartbeat tick"
        );
    }

    #[test]
    fn test_validate_rejects_bad_inflight() {
        let id = NodeId::new(1);
        assert_eq!(
            invalid_reason(&RaftConfig::new(id).with_max_inflight(0, 0)),
            "max inflight messages must be greater than 0"
        );
        let config = RaftConfig::new(id)
            .with_max_size_per_msg(1024)
            .with_max_inflight(16, 512);
        assert_eq!(
            invalid_reason(&config),
            "max inflight bytes must be >= max message size"
        );
    }

    #[test]
    fn test_lease_based_requires_check_quorum() {
        let config =
            RaftConfig::new(NodeId::new(1)).with_read_only_option(ReadOnlyOption::LeaseBased);
        assert!(config.validate().is_err());
        assert!(config.with_check_quorum(true).validate().is_ok());
    }
}
