use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::segment::init_checksum;

/// This is an abstraction for the unreliable segment transport underneath an
///  endpoint, introduced to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SegmentSocket: Send + Sync + 'static {
    /// Fire-and-forget: transmission errors are logged and swallowed, loss is
    ///  handled by retransmission anyway.
    async fn send_segment(&self, segment_buf: &[u8]);

    /// Receives the next segment into `buf`, returning the number of bytes.
    ///  An error means the transport is gone, not that a segment was bad.
    async fn recv_segment(&self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

/// A [SegmentSocket] over a UDP socket connected to a single peer. The
///  connect() filters out datagrams from other sources, each endpoint talks
///  to exactly one peer.
pub struct UdpSegmentSocket {
    socket: UdpSocket,
}

impl UdpSegmentSocket {
    pub async fn bind(local_addr: SocketAddr, peer_addr: SocketAddr) -> anyhow::Result<UdpSegmentSocket> {
        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(peer_addr).await?;
        Ok(UdpSegmentSocket { socket })
    }
}

#[async_trait]
impl SegmentSocket for UdpSegmentSocket {
    async fn send_segment(&self, segment_buf: &[u8]) {
        trace!("UDP socket: sending segment of {} bytes", segment_buf.len());

        if let Err(e) = self.socket.send(segment_buf).await {
            error!("error sending UDP segment: {}", e);
        }
    }

    async fn recv_segment(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let len = self.socket.recv(buf).await?;
        trace!("UDP socket: received segment of {} bytes", len);
        Ok(len)
    }
}

#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SegmentSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SegmentSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    /// Patches the checksum into the serialized segment and sends it. All
    ///  outbound segments go through here exactly once; retransmissions reuse
    ///  the finalized buffer via [SendPipeline::do_send].
    pub async fn finalize_and_send(&self, segment_buf: &mut [u8]) {
        init_checksum(segment_buf);
        self.socket.send_segment(segment_buf).await;
    }

    /// Sends an already finalized segment (retransmission path).
    pub async fn do_send(&self, segment_buf: &[u8]) {
        self.socket.send_segment(segment_buf).await;
    }
}
