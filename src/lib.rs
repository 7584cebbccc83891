//! A connection-oriented, reliable, one-way transport protocol on top of an
//!  unreliable segment transport. One endpoint (the client) sends a byte
//!  stream, the other (the server) receives it; the protocol recovers from
//!  segment loss, duplication, reordering and corruption underneath.
//!
//! ## Design goals
//!
//! * Connection-oriented: a three-way handshake establishes the connection,
//!   a FIN exchange tears it down. Exactly one connection per endpoint pair,
//!   no multiplexing.
//! * Strictly one-way payload flow: the client sends data, the server only
//!   ever responds with control segments (acknowledgements)
//! * In-order, exactly-once delivery via go-back-N:
//!   * the receiver accepts only the next in-sequence segment and
//!     re-acknowledges its current position for anything else
//!   * acknowledgements are cumulative - an acknum covers every segment
//!     below it, so lost ACKs are absorbed by later ones
//!   * the sender retransmits un-acked segments on a fixed timeout, there is
//!     no RTT estimation and no selective repeat
//! * Fixed flow control window advertised by the receiver, derived from its
//!   free buffer space; no congestion control
//! * Every segment is protected by an internet checksum (one's complement
//!   sum with end-around carry); corrupted segments are silently dropped and
//!   recovered like lost ones
//! * Sequence numbers count segments, not bytes, and never wrap: a
//!   connection is limited to 2^16 segments over its lifetime
//!
//! ## Wire format
//!
//! Every segment is exactly 1018 bytes: a 10 byte header followed by a 1008
//!  byte payload area, zero-padded beyond the meaningful length. All numbers
//!  in network byte order (BE):
//!
//! ```ascii
//! 0:  seqnum (u16) - the segment's position in its sender's send order
//! 2:  acknum (u16) - cumulative: the next seqnum the sender of this segment
//!      expects from its peer
//! 4:  flags (u8):
//!     * bit 2: SYN
//!     * bit 1: ACK
//!     * bit 0: FIN
//!     * all other bits unused, ignored on receipt
//! 5:  window (u8) - the sender's advertised flow control window, in segments
//! 6:  length (u16) - number of meaningful payload bytes
//! 8:  checksum (u16) - internet checksum over the entire segment with this
//!      field set to zero
//! ```
//!
//! ## Concurrency model
//!
//! Each endpoint spawns a single driver task that owns the transport and all
//!  protocol counters. The public handles ([ClientSocket], [ServerSocket])
//!  communicate with it exclusively through channels: bounded mpsc backlogs
//!  for payload data, oneshot completions for the blocking calls, and a
//!  watch channel for state visibility. No protocol state is shared between
//!  tasks.

pub mod client;
pub mod config;
pub mod connection;
pub mod segment;
mod send_pipeline;
pub mod seq_num;
pub mod server;

pub use client::ClientSocket;
pub use config::RelSegConfig;
pub use connection::ConnectionState;
pub use send_pipeline::{SegmentSocket, UdpSegmentSocket};
pub use server::ServerSocket;
