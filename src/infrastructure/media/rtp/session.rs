//! RTP transport for streaming sessions
//!
//! Owns the UDP socket negotiated in SDP. Outbound frames get increasing
//! sequence numbers and sample-based timestamps, inbound packets are parsed
//! and their payloads handed to the listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::packet::{RtpError, RtpPacket};

/// Inbound media callback
pub trait RtpListener: Send + Sync {
    fn on_media_received(&self, payload_type: u8, timestamp: u32, payload: Bytes);
}

pub struct RtpTransport {
    socket: Arc<UdpSocket>,
    remote_addr: SocketAddr,
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    packets_sent: AtomicU32,
    stopped: Arc<AtomicBool>,
    receive_task: tokio::task::JoinHandle<()>,
}

impl RtpTransport {
    /// Bind the local media port and start receiving from the peer
    pub async fn start(
        bind_addr: &str,
        remote_addr: SocketAddr,
        payload_type: u8,
        clock_rate: u32,
        listener: Arc<dyn RtpListener>,
    ) -> Result<Self, RtpError> {
        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .map_err(|e| RtpError::Io(e.to_string()))?,
        );
        info!(
            "RTP transport on {} toward {}",
            socket.local_addr().map_err(|e| RtpError::Io(e.to_string()))?,
            remote_addr
        );

        let stopped = Arc::new(AtomicBool::new(false));
        let receive_task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            listener,
            Arc::clone(&stopped),
        ));

        let mut rng = rand::thread_rng();
        Ok(Self {
            socket,
            remote_addr,
            ssrc: rng.gen(),
            payload_type,
            clock_rate,
            sequence: AtomicU16::new(rng.gen()),
            timestamp: AtomicU32::new(rng.gen()),
            packets_sent: AtomicU32::new(0),
            stopped,
            receive_task,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Send one media frame covering `samples` clock ticks
    pub async fn send_frame(&self, payload: Bytes, samples: u32, marker: bool) -> Result<(), RtpError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RtpError::Io("transport stopped".to_string()));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.timestamp.fetch_add(samples, Ordering::Relaxed);

        let mut packet = RtpPacket::new(self.payload_type, sequence, timestamp, self.ssrc, payload);
        packet.marker = marker;

        self.socket
            .send_to(&packet.serialize(), self.remote_addr)
            .await
            .map_err(|e| RtpError::Io(e.to_string()))?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Frame duration helper for the negotiated clock rate
    pub fn samples_for_ms(&self, ms: u32) -> u32 {
        (ms as u64 * self.clock_rate as u64 / 1000) as u32
    }

    /// Idempotent teardown
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping RTP transport");
        self.receive_task.abort();
    }
}

impl Drop for RtpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    listener: Arc<dyn RtpListener>,
    stopped: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _)) => n,
            Err(e) => {
                if !stopped.load(Ordering::SeqCst) {
                    warn!("RTP receive failed: {}", e);
                }
                return;
            }
        };
        match RtpPacket::parse(&buf[..n]) {
            Ok(packet) => {
                listener.on_media_received(packet.payload_type, packet.timestamp, packet.payload);
            }
            Err(e) => debug!("Dropping malformed RTP packet: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Sink {
        frames: Mutex<Vec<(u8, Bytes)>>,
    }

    impl RtpListener for Sink {
        fn on_media_received(&self, payload_type: u8, _timestamp: u32, payload: Bytes) {
            self.frames.lock().unwrap().push((payload_type, payload));
        }
    }

    struct NullSink;
    impl RtpListener for NullSink {
        fn on_media_received(&self, _pt: u8, _ts: u32, _payload: Bytes) {}
    }

    #[tokio::test]
    async fn test_frames_flow_between_transports() {
        let sink = Arc::new(Sink::default());

        let b = RtpTransport::start(
            "127.0.0.1:0",
            "127.0.0.1:9".parse().unwrap(),
            0,
            8000,
            Arc::clone(&sink) as Arc<dyn RtpListener>,
        )
        .await
        .unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();

        let a = RtpTransport::start("127.0.0.1:0", b_addr, 0, 8000, Arc::new(NullSink))
            .await
            .unwrap();

        a.send_frame(Bytes::from_static(b"frame-1"), 160, true)
            .await
            .unwrap();
        a.send_frame(Bytes::from_static(b"frame-2"), 160, false)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, Bytes::from_static(b"frame-1"));
        assert_eq!(a.packets_sent(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_blocks_sending() {
        let t = RtpTransport::start(
            "127.0.0.1:0",
            "127.0.0.1:9".parse().unwrap(),
            8,
            8000,
            Arc::new(NullSink),
        )
        .await
        .unwrap();

        assert_eq!(t.samples_for_ms(20), 160);

        t.stop();
        t.stop();
        assert!(t
            .send_frame(Bytes::from_static(b"late"), 160, false)
            .await
            .is_err());
    }
}
