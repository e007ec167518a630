//! System event model.
//!
//! An [`Event`] is one kernel-observed occurrence: a monotonic timestamp,
//! a type tag from the closed [`EventType`] set, thread/process
//! identifiers, an optional container identifier, and an opaque parameter
//! payload the agent never interprets.
//!
//! Events are produced by an external source (see [`source`]), owned by
//! the capture ring while buffered, by the policy engine during
//! evaluation, and by any capture job that selected them.

mod codec;
pub mod filter;
pub mod source;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use codec::{decode_frame, encode_frame, encoded_len, CodecError, MAX_EVENT_FRAME};

/// The closed set of event type tags.
///
/// The discriminant doubles as the bit index in an [`EventTypeSet`] and as
/// the on-wire type tag, so the order is part of the frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum EventType {
    /// File open.
    Open = 0,
    /// File descriptor close.
    Close = 1,
    /// Read from a file descriptor.
    Read = 2,
    /// Write to a file descriptor.
    Write = 3,
    /// Outbound connection.
    Connect = 4,
    /// Inbound connection accepted.
    Accept = 5,
    /// Datagram or stream send.
    Send = 6,
    /// Datagram or stream receive.
    Recv = 7,
    /// Program execution.
    Exec = 8,
    /// Process or thread creation.
    Clone = 9,
    /// Process exit.
    Exit = 10,
    /// Working directory change.
    Chdir = 11,
    /// Directory creation.
    Mkdir = 12,
    /// File unlink.
    Unlink = 13,
    /// File rename.
    Rename = 14,
    /// Credential change.
    Setuid = 15,
}

impl EventType {
    /// Number of event types in the closed set.
    pub const COUNT: usize = 16;

    /// All event types, in tag order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Open,
        Self::Close,
        Self::Read,
        Self::Write,
        Self::Connect,
        Self::Accept,
        Self::Send,
        Self::Recv,
        Self::Exec,
        Self::Clone,
        Self::Exit,
        Self::Chdir,
        Self::Mkdir,
        Self::Unlink,
        Self::Rename,
        Self::Setuid,
    ];

    /// The on-wire tag for this event type.
    #[must_use]
    pub const fn tag(self) -> u16 {
        self as u16
    }

    /// Looks up an event type by its on-wire tag.
    #[must_use]
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Stable lowercase name, matching the configuration spelling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::Connect => "connect",
            Self::Accept => "accept",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::Exec => "exec",
            Self::Clone => "clone",
            Self::Exit => "exit",
            Self::Chdir => "chdir",
            Self::Mkdir => "mkdir",
            Self::Unlink => "unlink",
            Self::Rename => "rename",
            Self::Setuid => "setuid",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A bitset over [`EventType`] tags.
///
/// Policies compute one of these at compile time so per-event candidate
/// selection is a single bit test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventTypeSet(u32);

impl EventTypeSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set containing every event type.
    #[must_use]
    pub const fn all() -> Self {
        Self((1 << EventType::COUNT as u32) - 1)
    }

    /// Returns `true` if no types are present.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if `t` is present.
    #[must_use]
    pub const fn contains(self, t: EventType) -> bool {
        self.0 & (1 << t.tag()) != 0
    }

    /// Adds `t` to the set.
    pub fn insert(&mut self, t: EventType) {
        self.0 |= 1 << t.tag();
    }

    /// Returns the union of the two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Number of types present.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the types present, in tag order.
    pub fn iter(self) -> impl Iterator<Item = EventType> {
        EventType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<EventType> for EventTypeSet {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        let mut set = Self::empty();
        for t in iter {
            set.insert(t);
        }
        set
    }
}

/// One kernel-observed occurrence.
///
/// Immutable once constructed; cloning is cheap (the parameter payload is
/// a refcounted [`Bytes`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Monotonic timestamp in nanoseconds.
    pub ts_ns: u64,

    /// Type tag.
    pub event_type: EventType,

    /// Thread identifier.
    pub thread_id: u32,

    /// Process identifier.
    pub process_id: u32,

    /// Container identifier, `None` for host processes.
    pub container_id: Option<String>,

    /// Opaque parameter payload.
    pub params: Bytes,
}

impl Event {
    /// Container id as a borrowed str, if any.
    #[must_use]
    pub fn container(&self) -> Option<&str> {
        self.container_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for t in EventType::ALL {
            assert_eq!(EventType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(EventType::from_tag(EventType::COUNT as u16), None);
    }

    #[test]
    fn test_type_set_union_and_contains() {
        let a: EventTypeSet = [EventType::Open, EventType::Exec].into_iter().collect();
        let b: EventTypeSet = [EventType::Exec, EventType::Connect].into_iter().collect();
        let u = a.union(b);

        assert!(u.contains(EventType::Open));
        assert!(u.contains(EventType::Exec));
        assert!(u.contains(EventType::Connect));
        assert!(!u.contains(EventType::Close));
        assert_eq!(u.len(), 3);
    }

    #[test]
    fn test_all_set_covers_every_type() {
        let all = EventTypeSet::all();
        for t in EventType::ALL {
            assert!(all.contains(t));
        }
    }
}
