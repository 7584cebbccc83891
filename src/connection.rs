use std::fmt::{Display, Formatter};

use bytes::BytesMut;
use tokio::time::Instant;

use crate::seq_num::SeqNum;

/// Lifecycle of an endpoint. Client endpoints move through
///  `Closed -> SynSent -> Established -> FinSent -> Closed`, server endpoints
///  through `Closed -> Accepting -> SynRcvd -> Established -> Closing ->
///  Closed`. The set is shared so that both handles can publish their state
///  through the same channel type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Accepting,
    SynSent,
    SynRcvd,
    Established,
    FinSent,
    Closing,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Accepting => "ACCEPTING",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynRcvd => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinSent => "FIN_SENT",
            ConnectionState::Closing => "CLOSING",
        };
        write!(f, "{}", s)
    }
}

/// A sent but not yet cumulatively acknowledged segment, kept around for
///  timeout-based retransmission. Stored in send order, so the in-flight list
///  is always sorted by `seq_num`.
#[derive(Debug)]
pub struct InFlightSegment {
    pub seq_num: SeqNum,
    /// (re)transmission timestamp, refreshed on every retransmission
    pub sent_at: Instant,
    /// full serialized segment including the finalized checksum
    pub segment: BytesMut,
}
