//! Membership changes: the change requests carried in log entries and the
//! [`Changer`] that applies them to the tracked configuration.
//!
//! Two request shapes exist. A legacy request carries exactly one change and
//! never uses joint consensus. A list request may carry several changes; it
//! enters a joint configuration when it has more than one change or asks for
//! an explicit transition, and an empty list asks to leave the joint
//! configuration. Both shapes are normalized into a list of
//! [`ConfChangeSingle`] before the changer sees them.

mod changer;
mod restore;

pub use changer::{check_invariants, Changer};
pub use restore::restore;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::NodeId;

use crate::error::{RaftError, RaftResult};
use crate::message::{Entry, EntryType};

/// The operation a single change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfChangeType {
    /// Add a voter, or promote a learner.
    AddNode,
    /// Add a learner, or demote a voter.
    AddLearnerNode,
    /// Remove a peer.
    RemoveNode,
    /// Update a peer's metadata; membership is unaffected.
    UpdateNode,
}

impl ConfChangeType {
    const fn tag(self) -> u8 {
        match self {
            Self::AddNode => 0,
            Self::RemoveNode => 1,
            Self::UpdateNode => 2,
            Self::AddLearnerNode => 3,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::AddNode),
            1 => Some(Self::RemoveNode),
            2 => Some(Self::UpdateNode),
            3 => Some(Self::AddLearnerNode),
            _ => None,
        }
    }
}

/// One membership operation on one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfChangeSingle {
    /// What to do.
    pub change_type: ConfChangeType,
    /// Which peer.
    pub node_id: NodeId,
}

impl ConfChangeSingle {
    /// Creates a change.
    #[must_use]
    pub const fn new(change_type: ConfChangeType, node_id: u64) -> Self {
        Self {
            change_type,
            node_id: NodeId::new(node_id),
        }
    }
}

/// How a list change moves through joint consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConfChangeTransition {
    /// Joint consensus only when required, leaving it automatically.
    #[default]
    Auto,
    /// Always joint, leaving it automatically.
    JointImplicit,
    /// Always joint; the application must propose leaving it.
    JointExplicit,
}

impl ConfChangeTransition {
    const fn tag(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::JointImplicit => 1,
            Self::JointExplicit => 2,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Auto),
            1 => Some(Self::JointImplicit),
            2 => Some(Self::JointExplicit),
            _ => None,
        }
    }
}

/// A membership change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfChange {
    /// A single change that never uses joint consensus.
    LegacySingle {
        /// The change.
        change: ConfChangeSingle,
        /// Opaque application context.
        context: Bytes,
    },
    /// Zero or more changes.
    List {
        /// Joint consensus behaviour.
        transition: ConfChangeTransition,
        /// The changes; empty means "leave the joint configuration".
        changes: Vec<ConfChangeSingle>,
        /// Opaque application context.
        context: Bytes,
    },
}

impl ConfChange {
    /// Creates a legacy single change.
    #[must_use]
    pub const fn single(change_type: ConfChangeType, node_id: u64) -> Self {
        Self::LegacySingle {
            change: ConfChangeSingle::new(change_type, node_id),
            context: Bytes::new(),
        }
    }

    /// Creates a list change with the `Auto` transition.
    #[must_use]
    pub const fn list(changes: Vec<ConfChangeSingle>) -> Self {
        Self::List {
            transition: ConfChangeTransition::Auto,
            changes,
            context: Bytes::new(),
        }
    }

    /// Creates the request that leaves a joint configuration.
    #[must_use]
    pub const fn leave() -> Self {
        Self::list(Vec::new())
    }

    /// The normalized list of operations.
    #[must_use]
    pub fn changes(&self) -> Vec<ConfChangeSingle> {
        match self {
            Self::LegacySingle { change, .. } => vec![*change],
            Self::List { changes, .. } => changes.clone(),
        }
    }

    /// Opaque application context.
    #[must_use]
    pub const fn context(&self) -> &Bytes {
        match self {
            Self::LegacySingle { context, .. } | Self::List { context, .. } => context,
        }
    }

    /// Returns `Some(auto_leave)` if applying this change enters a joint
    /// configuration.
    #[must_use]
    pub fn enter_joint(&self) -> Option<bool> {
        match self {
            Self::LegacySingle { .. } => None,
            Self::List {
                transition,
                changes,
                ..
            } => {
                if *transition == ConfChangeTransition::Auto && changes.len() <= 1 {
                    return None;
                }
                Some(matches!(
                    transition,
                    ConfChangeTransition::Auto | ConfChangeTransition::JointImplicit
                ))
            }
        }
    }

    /// Returns true if this change leaves a joint configuration.
    #[must_use]
    pub fn leave_joint(&self) -> bool {
        matches!(
            self,
            Self::List {
                transition: ConfChangeTransition::Auto,
                changes,
                ..
            } if changes.is_empty()
        )
    }

    /// The entry type that carries this change.
    #[must_use]
    pub const fn entry_type(&self) -> EntryType {
        match self {
            Self::LegacySingle { .. } => EntryType::ConfChange,
            Self::List { .. } => EntryType::ConfChangeV2,
        }
    }

    /// Wraps this change into an (unstamped) log entry.
    #[must_use]
    pub fn to_entry(&self) -> Entry {
        Entry {
            entry_type: self.entry_type(),
            data: self.encode(),
            ..Entry::default()
        }
    }

    /// Encodes the change as an entry payload.
    ///
    /// Format (little-endian):
    /// - legacy: type (1) + node (8) + context
    /// - list: transition (1) + count (4) + count * (type (1) + node (8)) + context
    ///
    /// where context is a 4-byte length followed by the bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::LegacySingle { change, context } => {
                buf.put_u8(change.change_type.tag());
                buf.put_u64_le(change.node_id.get());
                put_context(&mut buf, context);
            }
            Self::List {
                transition,
                changes,
                context,
            } => {
                buf.put_u8(transition.tag());
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(changes.len() as u32);
                for change in changes {
                    buf.put_u8(change.change_type.tag());
                    buf.put_u64_le(change.node_id.get());
                }
                put_context(&mut buf, context);
            }
        }
        buf.freeze()
    }

    /// Decodes the payload of a conf change entry.
    ///
    /// # Errors
    /// Returns an error if the entry is not a conf change or the payload is
    /// malformed.
    pub fn decode(entry_type: EntryType, mut buf: &[u8]) -> RaftResult<Self> {
        const MALFORMED: RaftError = RaftError::Malformed {
            what: "conf change",
        };

        match entry_type {
            EntryType::Normal => Err(MALFORMED),
            EntryType::ConfChange => {
                let change = get_change(&mut buf).ok_or(MALFORMED)?;
                let context = get_context(&mut buf).ok_or(MALFORMED)?;
                Ok(Self::LegacySingle { change, context })
            }
            EntryType::ConfChangeV2 => {
                if buf.remaining() < 5 {
                    return Err(MALFORMED);
                }
                let transition = ConfChangeTransition::from_tag(buf.get_u8()).ok_or(MALFORMED)?;
                let count = buf.get_u32_le() as usize;
                // Every change is 9 bytes; refuse counts the payload cannot hold.
                if buf.remaining() < count.saturating_mul(9) {
                    return Err(MALFORMED);
                }
                let changes = (0..count)
                    .map(|_| get_change(&mut buf))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(MALFORMED)?;
                let context = get_context(&mut buf).ok_or(MALFORMED)?;
                Ok(Self::List {
                    transition,
                    changes,
                    context,
                })
            }
        }
    }
}

fn put_context(buf: &mut BytesMut, context: &Bytes) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(context.len() as u32);
    buf.put_slice(context);
}

fn get_context(buf: &mut &[u8]) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

fn get_change(buf: &mut &[u8]) -> Option<ConfChangeSingle> {
    if buf.remaining() < 9 {
        return None;
    }
    let change_type = ConfChangeType::from_tag(buf.get_u8())?;
    let node_id = NodeId::new(buf.get_u64_le());
    Some(ConfChangeSingle {
        change_type,
        node_id,
    })
}

/// Parses a space-separated list of changes such as `"v1 l2 r3 u4"`:
/// `v` adds a voter, `l` a learner, `r` removes and `u` updates.
///
/// # Errors
/// Returns an error on an unknown prefix or an unparsable ID.
pub fn conf_changes_from_string(s: &str) -> RaftResult<Vec<ConfChangeSingle>> {
    s.split_whitespace()
        .map(|tok| {
            let mut chars = tok.chars();
            let change_type = match chars.next() {
                Some('v') => ConfChangeType::AddNode,
                Some('l') => ConfChangeType::AddLearnerNode,
                Some('r') => ConfChangeType::RemoveNode,
                Some('u') => ConfChangeType::UpdateNode,
                _ => return Err(RaftError::conf_change(format!("unknown input: {tok}"))),
            };
            let id = chars
                .as_str()
                .parse::<u64>()
                .map_err(|e| RaftError::conf_change(format!("{tok}: {e}")))?;
            Ok(ConfChangeSingle::new(change_type, id))
        })
        .collect()
}

/// Formats changes in the form accepted by [`conf_changes_from_string`].
#[must_use]
pub fn conf_changes_to_string(changes: &[ConfChangeSingle]) -> String {
    let parts: Vec<String> = changes.iter().map(ToString::to_string).collect();
    parts.join(" ")
}

impl fmt::Display for ConfChangeSingle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.change_type {
            ConfChangeType::AddNode => 'v',
            ConfChangeType::AddLearnerNode => 'l',
            ConfChangeType::RemoveNode => 'r',
            ConfChangeType::UpdateNode => 'u',
        };
        write!(f, "{prefix}{}", self.node_id.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_changes_string_forms() {
        let ccs = conf_changes_from_string("v1 l2  r3 u4").unwrap();
        assert_eq!(
            ccs,
            vec![
                ConfChangeSingle::new(ConfChangeType::AddNode, 1),
                ConfChangeSingle::new(ConfChangeType::AddLearnerNode, 2),
                ConfChangeSingle::new(ConfChangeType::RemoveNode, 3),
                ConfChangeSingle::new(ConfChangeType::UpdateNode, 4),
            ]
        );
        assert_eq!(conf_changes_to_string(&ccs), "v1 l2 r3 u4");
        assert!(conf_changes_from_string("").unwrap().is_empty());

        assert!(conf_changes_from_string("x1").is_err());
        assert!(conf_changes_from_string("vfoo").is_err());
    }

    #[test]
    fn test_enter_and_leave_joint() {
        let single = ConfChange::single(ConfChangeType::AddNode, 2);
        assert_eq!(single.enter_joint(), None);
        assert!(!single.leave_joint());

        let one = ConfChange::list(conf_changes_from_string("v2").unwrap());
        assert_eq!(one.enter_joint(), None);

        let two = ConfChange::list(conf_changes_from_string("v2 v3").unwrap());
        assert_eq!(two.enter_joint(), Some(true));

        let explicit = ConfChange::List {
            transition: ConfChangeTransition::JointExplicit,
            changes: conf_changes_from_string("v2").unwrap(),
            context: Bytes::new(),
        };
        assert_eq!(explicit.enter_joint(), Some(false));

        assert!(ConfChange::leave().leave_joint());
        assert_eq!(ConfChange::leave().enter_joint(), None);
        // Context does not matter for leaving.
        let leave_with_ctx = ConfChange::List {
            transition: ConfChangeTransition::Auto,
            changes: Vec::new(),
            context: Bytes::from_static(b"ctx"),
        };
        assert!(leave_with_ctx.leave_joint());
    }

    #[test]
    fn test_codec_preserves_both_shapes() {
        let single = ConfChange::LegacySingle {
            change: ConfChangeSingle::new(ConfChangeType::RemoveNode, 9),
            context: Bytes::from_static(b"why"),
        };
        let entry = single.to_entry();
        assert_eq!(entry.entry_type, EntryType::ConfChange);
        let decoded = ConfChange::decode(entry.entry_type, &entry.data).unwrap();
        assert_eq!(decoded, single);

        let list = ConfChange::List {
            transition: ConfChangeTransition::JointImplicit,
            changes: conf_changes_from_string("v1 l2 r3").unwrap(),
            context: Bytes::new(),
        };
        let entry = list.to_entry();
        assert_eq!(entry.entry_type, EntryType::ConfChangeV2);
        let decoded = ConfChange::decode(entry.entry_type, &entry.data).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ConfChange::decode(EntryType::ConfChange, &[]).is_err());
        let bad = [0, 255, 255, 255, 255];
        assert!(ConfChange::decode(EntryType::ConfChangeV2, &bad).is_err());
        assert!(ConfChange::decode(EntryType::Normal, b"payload").is_err());
        assert!(ConfChange::decode(EntryType::ConfChange, &[9; 13]).is_err());
    }
}
