//! MSRP connection management
//!
//! One TCP connection per media session. The negotiated SDP setup role
//! decides who dials: the active side connects to the peer's path, the
//! passive side accepts a single inbound connection. Sending and receiving
//! run as independent workers over split stream halves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::message::{
    generate_message_id, generate_transaction_id, ByteRange, ContinuationFlag, MsrpChunk,
    MsrpDecoder, MsrpError,
};

/// Largest SEND body before a message is split into chunks
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

const SEND_QUEUE_CAPACITY: usize = 32;
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Callbacks from the receive worker toward the owning session
pub trait MsrpEventListener: Send + Sync {
    /// A complete message was reassembled
    fn on_message_received(&self, message_id: &str, content_type: &str, data: Vec<u8>) {
        let _ = (message_id, content_type, data);
    }

    /// Cumulative progress for a transfer in either direction
    fn on_progress(&self, current: u64, total: u64) {
        let _ = (current, total);
    }

    /// Success REPORT received for a message we sent
    fn on_report_received(&self, message_id: &str, status_code: u16) {
        let _ = (message_id, status_code);
    }

    /// The connection failed or the peer aborted a transfer
    fn on_transfer_error(&self, reason: &str) {
        let _ = reason;
    }
}

/// Local and remote MSRP paths from the negotiated SDP
#[derive(Debug, Clone)]
pub struct MsrpPaths {
    pub local_path: String,
    pub remote_path: String,
}

/// An established MSRP connection with its two workers running
pub struct MsrpConnection {
    paths: MsrpPaths,
    send_queue: mpsc::Sender<MsrpChunk>,
    terminated: Arc<AtomicBool>,
    sender_task: tokio::task::JoinHandle<()>,
    receiver_task: tokio::task::JoinHandle<()>,
}

impl MsrpConnection {
    /// Active role: dial the peer's advertised host and port
    pub async fn connect(
        remote_addr: &str,
        paths: MsrpPaths,
        listener: Arc<dyn MsrpEventListener>,
    ) -> Result<Self, MsrpError> {
        info!("Connecting MSRP to {}", remote_addr);
        let stream = TcpStream::connect(remote_addr)
            .await
            .map_err(|e| MsrpError::Io(e.to_string()))?;
        Ok(Self::start(stream, paths, listener))
    }

    /// Passive role: accept one inbound connection on the local media port
    pub async fn accept(
        tcp_listener: TcpListener,
        paths: MsrpPaths,
        listener: Arc<dyn MsrpEventListener>,
    ) -> Result<Self, MsrpError> {
        let accepted = tokio::time::timeout(ACCEPT_TIMEOUT, tcp_listener.accept())
            .await
            .map_err(|_| MsrpError::Io("timed out waiting for MSRP connection".to_string()))?
            .map_err(|e| MsrpError::Io(e.to_string()))?;
        let (stream, peer) = accepted;
        info!("Accepted MSRP connection from {}", peer);
        Ok(Self::start(stream, paths, listener))
    }

    fn start(
        stream: TcpStream,
        paths: MsrpPaths,
        listener: Arc<dyn MsrpEventListener>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (send_queue, queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let terminated = Arc::new(AtomicBool::new(false));
        let error_reported = Arc::new(AtomicBool::new(false));

        let sender = ChunkSender {
            queue: queue_rx,
            write_half,
            listener: Arc::clone(&listener),
            terminated: Arc::clone(&terminated),
            error_reported: Arc::clone(&error_reported),
        };
        let receiver = ChunkReceiver {
            read_half,
            decoder: MsrpDecoder::new(),
            pending: HashMap::new(),
            send_queue: send_queue.clone(),
            local_path: paths.local_path.clone(),
            listener,
            terminated: Arc::clone(&terminated),
            error_reported,
        };

        let sender_task = tokio::spawn(sender.run());
        let receiver_task = tokio::spawn(receiver.run());

        Self {
            paths,
            send_queue,
            terminated,
            sender_task,
            receiver_task,
        }
    }

    /// Queue a message, splitting it into chunks when it exceeds the
    /// chunk size. All chunks of one message share a transaction id.
    pub async fn send_message(
        &self,
        content_type: &str,
        data: &[u8],
    ) -> Result<String, MsrpError> {
        let message_id = generate_message_id();
        let transaction_id = generate_transaction_id();
        let total = data.len() as u64;

        if data.is_empty() {
            return Err(MsrpError::Framing("empty message body".to_string()));
        }

        let mut offset = 0usize;
        while offset < data.len() {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(MsrpError::Terminated);
            }
            let end = (offset + DEFAULT_CHUNK_SIZE).min(data.len());
            let range = ByteRange {
                start: offset as u64 + 1,
                end: Some(end as u64),
                total: Some(total),
            };
            let flag = if end == data.len() {
                ContinuationFlag::Complete
            } else {
                ContinuationFlag::More
            };
            let chunk = MsrpChunk::new_send(
                &transaction_id,
                &self.paths.remote_path,
                &self.paths.local_path,
                &message_id,
                range,
                content_type,
                data[offset..end].to_vec(),
                flag,
            );
            self.send_queue
                .send(chunk)
                .await
                .map_err(|_| MsrpError::Terminated)?;
            offset = end;
        }
        Ok(message_id)
    }

    /// Bodiless SEND to keep NAT bindings alive
    pub async fn send_keepalive(&self) -> Result<(), MsrpError> {
        let chunk = MsrpChunk::new_keepalive(
            &generate_transaction_id(),
            &self.paths.remote_path,
            &self.paths.local_path,
        );
        self.send_queue
            .send(chunk)
            .await
            .map_err(|_| MsrpError::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Deliberate shutdown. Worker failures after this point are not
    /// surfaced as transfer errors.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Terminating MSRP connection");
        self.sender_task.abort();
        self.receiver_task.abort();
    }
}

impl Drop for MsrpConnection {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Drains the send queue onto the socket
struct ChunkSender {
    queue: mpsc::Receiver<MsrpChunk>,
    write_half: OwnedWriteHalf,
    listener: Arc<dyn MsrpEventListener>,
    terminated: Arc<AtomicBool>,
    error_reported: Arc<AtomicBool>,
}

impl ChunkSender {
    async fn run(mut self) {
        while let Some(chunk) = self.queue.recv().await {
            let wire = chunk.to_bytes();
            if let Err(e) = self.write_half.write_all(&wire).await {
                if !self.terminated.load(Ordering::SeqCst)
                    && !self.error_reported.swap(true, Ordering::SeqCst)
                {
                    warn!("MSRP write failed: {}", e);
                    self.listener
                        .on_transfer_error(&format!("write failed: {}", e));
                }
                return;
            }
            // Outbound progress is reported as each data chunk hits the wire
            if chunk.is_send() {
                if let Some(range) = chunk.byte_range() {
                    if let (Some(end), Some(total)) = (range.end, range.total) {
                        self.listener.on_progress(end, total);
                    }
                }
            }
        }
        debug!("MSRP send queue closed");
    }
}

/// In-progress reassembly of one chunked message
struct DataChunks {
    message_id: String,
    content_type: String,
    data: Vec<u8>,
    total: Option<u64>,
    reporting: bool,
    from_path: String,
}

/// Reads the socket, reassembles messages and answers transactions
struct ChunkReceiver {
    read_half: OwnedReadHalf,
    decoder: MsrpDecoder,
    // Receive-in-progress per transaction id
    pending: HashMap<String, DataChunks>,
    send_queue: mpsc::Sender<MsrpChunk>,
    local_path: String,
    listener: Arc<dyn MsrpEventListener>,
    terminated: Arc<AtomicBool>,
    error_reported: Arc<AtomicBool>,
}

impl ChunkReceiver {
    async fn run(mut self) {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match self.read_half.read(&mut buf).await {
                Ok(0) => {
                    self.report_error("connection closed by peer");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    self.report_error(&format!("read failed: {}", e));
                    return;
                }
            };
            self.decoder.feed(&buf[..n]);
            loop {
                match self.decoder.decode() {
                    Ok(Some(chunk)) => self.handle_chunk(chunk).await,
                    Ok(None) => break,
                    Err(e) => {
                        self.report_error(&format!("framing error: {}", e));
                        return;
                    }
                }
            }
        }
    }

    fn report_error(&self, reason: &str) {
        // A deliberate terminate is not a transfer failure
        if self.terminated.load(Ordering::SeqCst) {
            debug!("MSRP receiver stopping: {}", reason);
            return;
        }
        if !self.error_reported.swap(true, Ordering::SeqCst) {
            warn!("MSRP receive error: {}", reason);
            self.listener.on_transfer_error(reason);
        }
    }

    async fn handle_chunk(&mut self, chunk: MsrpChunk) {
        if chunk.is_send() {
            self.handle_send(chunk).await;
        } else if chunk.is_report() {
            if let (Some(message_id), Some(status)) = (chunk.message_id(), chunk.report_status()) {
                debug!("REPORT for {}: {}", message_id, status);
                self.listener.on_report_received(message_id, status);
            }
        } else if let Some(code) = chunk.response_code() {
            if code >= 300 {
                self.report_error(&format!("peer rejected chunk with {}", code));
            }
        }
    }

    async fn handle_send(&mut self, chunk: MsrpChunk) {
        // Every SEND is acknowledged, keep-alives included
        self.respond(&chunk, 200).await;

        let range = chunk.byte_range();
        if chunk.body.is_empty() && range.is_none() {
            debug!("MSRP keep-alive received");
            return;
        }

        let tx_id = chunk.transaction_id.clone();
        match chunk.continuation {
            ContinuationFlag::Abort => {
                self.pending.remove(&tx_id);
                self.report_error("transfer aborted by peer");
            }
            ContinuationFlag::More | ContinuationFlag::Complete => {
                let entry = self.pending.entry(tx_id.clone()).or_insert_with(|| {
                    DataChunks {
                        message_id: chunk.message_id().unwrap_or(&tx_id).to_string(),
                        content_type: chunk
                            .content_type()
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        data: Vec::new(),
                        total: None,
                        reporting: chunk.success_report_requested(),
                        from_path: chunk.from_path().unwrap_or_default().to_string(),
                    }
                });
                if let Some(total) = range.and_then(|r| r.total) {
                    entry.total = Some(total);
                }
                entry.data.extend_from_slice(&chunk.body);

                if let Some(total) = entry.total {
                    if (entry.data.len() as u64) > total {
                        self.pending.remove(&tx_id);
                        self.report_error("received more bytes than declared total");
                        return;
                    }
                    self.listener.on_progress(entry.data.len() as u64, total);
                }

                if chunk.continuation == ContinuationFlag::Complete {
                    if let Some(done) = self.pending.remove(&tx_id) {
                        self.deliver(done).await;
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, done: DataChunks) {
        debug!(
            "Message {} complete: {} bytes of {}",
            done.message_id,
            done.data.len(),
            done.content_type
        );
        if done.reporting {
            let report = MsrpChunk::new_report(
                &done.from_path,
                &self.local_path,
                &done.message_id,
                ByteRange::whole(done.data.len() as u64),
                200,
                "OK",
            );
            if self.send_queue.send(report).await.is_err() {
                debug!("Send queue closed, dropping REPORT");
            }
        }
        self.listener
            .on_message_received(&done.message_id, &done.content_type, done.data);
    }

    async fn respond(&self, request: &MsrpChunk, code: u16) {
        let response = MsrpChunk::new_response(request, code, &self.local_path);
        if self.send_queue.send(response).await.is_err() {
            debug!("Send queue closed, dropping response");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        messages: Mutex<Vec<(String, String, Vec<u8>)>>,
        progress: Mutex<Vec<(u64, u64)>>,
        errors: Mutex<Vec<String>>,
    }

    impl MsrpEventListener for RecordingListener {
        fn on_message_received(&self, message_id: &str, content_type: &str, data: Vec<u8>) {
            self.messages.lock().unwrap().push((
                message_id.to_string(),
                content_type.to_string(),
                data,
            ));
        }

        fn on_progress(&self, current: u64, total: u64) {
            self.progress.lock().unwrap().push((current, total));
        }

        fn on_transfer_error(&self, reason: &str) {
            self.errors.lock().unwrap().push(reason.to_string());
        }
    }

    fn paths(local_port: u16, remote_port: u16) -> MsrpPaths {
        MsrpPaths {
            local_path: format!("msrp://127.0.0.1:{}/local;tcp", local_port),
            remote_path: format!("msrp://127.0.0.1:{}/remote;tcp", remote_port),
        }
    }

    async fn connected_pair(
        local: Arc<RecordingListener>,
        remote: Arc<RecordingListener>,
    ) -> (MsrpConnection, MsrpConnection) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();

        let passive = tokio::spawn(MsrpConnection::accept(
            tcp,
            paths(port, 0),
            remote as Arc<dyn MsrpEventListener>,
        ));
        let active = MsrpConnection::connect(
            &format!("127.0.0.1:{}", port),
            paths(0, port),
            local as Arc<dyn MsrpEventListener>,
        )
        .await
        .unwrap();
        let passive = passive.await.unwrap().unwrap();
        (active, passive)
    }

    #[tokio::test]
    async fn test_single_chunk_message_delivery() {
        let local = Arc::new(RecordingListener::default());
        let remote = Arc::new(RecordingListener::default());
        let (active, _passive) =
            connected_pair(Arc::clone(&local), Arc::clone(&remote)).await;

        active
            .send_message("text/plain", b"hello over msrp")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let messages = remote.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, "text/plain");
        assert_eq!(messages[0].2, b"hello over msrp");
    }

    #[tokio::test]
    async fn test_chunked_message_reassembly() {
        let local = Arc::new(RecordingListener::default());
        let remote = Arc::new(RecordingListener::default());
        let (active, _passive) =
            connected_pair(Arc::clone(&local), Arc::clone(&remote)).await;

        // Three chunks worth of payload
        let payload: Vec<u8> = (0..DEFAULT_CHUNK_SIZE * 2 + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        active.send_message("application/octet-stream", &payload).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let messages = remote.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].2, payload);

        // Intermediate progress was observed before completion
        let progress = remote.progress.lock().unwrap();
        assert!(progress.len() >= 2);
        assert_eq!(
            progress.last().unwrap(),
            &(payload.len() as u64, payload.len() as u64)
        );
    }

    #[tokio::test]
    async fn test_keepalive_not_delivered_as_message() {
        let local = Arc::new(RecordingListener::default());
        let remote = Arc::new(RecordingListener::default());
        let (active, _passive) =
            connected_pair(Arc::clone(&local), Arc::clone(&remote)).await;

        active.send_keepalive().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(remote.messages.lock().unwrap().is_empty());
        assert!(remote.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_suppresses_error_report() {
        let local = Arc::new(RecordingListener::default());
        let remote = Arc::new(RecordingListener::default());
        let (active, passive) =
            connected_pair(Arc::clone(&local), Arc::clone(&remote)).await;

        passive.terminate();
        active.terminate();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(local.errors.lock().unwrap().is_empty());
        assert!(remote.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_disconnect_reports_error_once() {
        let local = Arc::new(RecordingListener::default());
        let remote = Arc::new(RecordingListener::default());
        let (active, passive) =
            connected_pair(Arc::clone(&local), Arc::clone(&remote)).await;

        // Hard drop without the deliberate terminate path on the other side
        drop(passive);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let errors = local.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        drop(errors);
        active.terminate();
    }
}
