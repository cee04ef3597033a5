//! SIP transport - client side, UDP towards the outbound proxy
//!
//! All signaling goes through the configured proxy (IMS outbound-proxy
//! model). Inbound datagrams are parsed here and handed to the dispatcher
//! channel; a malformed datagram is logged and skipped, never fatal.

use super::message::{SipError, SipMessage, SipRequest, SipResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Client SIP transport bound to one local socket
pub struct SipTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    proxy_addr: SocketAddr,
}

impl SipTransport {
    /// Bind the local socket and start the receive loop.
    ///
    /// Returns the transport and the channel carrying parsed inbound
    /// messages, drained by the service dispatcher.
    pub async fn bind(
        bind_addr: SocketAddr,
        proxy_addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SipMessage>), SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;

        info!("SIP transport listening on {} (proxy {})", local_addr, proxy_addr);

        let socket = Arc::new(socket);
        let transport = Arc::new(Self {
            socket: socket.clone(),
            local_addr,
            proxy_addr,
        });

        let (tx, rx) = mpsc::channel(1000);
        tokio::spawn(Self::receive_loop(socket, tx));

        Ok((transport, rx))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<SipMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {}", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                error!("Dispatcher channel closed, stopping receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Address string for Via headers
    pub fn via_address(&self) -> String {
        self.local_addr.to_string()
    }

    async fn send_bytes(&self, data: &[u8]) -> Result<(), SipError> {
        debug!("Sending {} bytes to {}", data.len(), self.proxy_addr);
        self.socket
            .send_to(data, self.proxy_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    pub async fn send_request(&self, request: &SipRequest) -> Result<(), SipError> {
        self.send_bytes(&request.to_bytes()).await
    }

    pub async fn send_response(&self, response: &SipResponse) -> Result<(), SipError> {
        self.send_bytes(&response.to_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let proxy: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let (transport, _rx) = SipTransport::bind(bind, proxy).await.unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        assert_eq!(transport.proxy_addr(), proxy);
    }

    #[tokio::test]
    async fn test_inbound_message_reaches_channel() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let proxy: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let (transport, mut rx) = SipTransport::bind(bind, proxy).await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let data = b"OPTIONS sip:alice@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bK1\r\n\
            From: <sip:bob@example.com>;tag=1\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: transport-test\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        sender.send_to(data, transport.local_addr()).await.unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.call_id(), Some("transport-test".to_string()));
    }
}
