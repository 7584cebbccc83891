use std::fmt::{Display, Formatter};
use rand::Rng;

/// A segment's position in its sender's send order. Sequence numbers are
///  segment-indexed (every transmitted segment consumes exactly one, including
///  handshake and teardown segments), not byte-indexed.
///
/// There is no wrap-around: a connection is limited to 2^16 segments over its
///  lifetime, and exceeding that budget is a bug in the calling application
///  rather than something this protocol recovers from.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    /// random initial sequence number for a new connection
    pub fn random() -> SeqNum {
        SeqNum(rand::thread_rng().gen())
    }

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(
            self.0.checked_add(1)
                .expect("sequence number space exhausted - the connection outlived its 2^16 segment budget")
        )
    }

    /// Number of segments from `earlier` (inclusive) up to `self` (exclusive).
    ///  Callers must ensure `earlier <= self`.
    pub fn distance_from(&self, earlier: SeqNum) -> u16 {
        debug_assert!(earlier <= *self);
        self.0 - earlier.0
    }
}
