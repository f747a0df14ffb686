//! Transaction management over a USB transport.
//!
//! Every request gets the next identifier from a wrapping counter and waits
//! on a oneshot channel. A background reader feeds bulk-in data to the frame
//! decoder and completes pending transactions by identifier, so responses may
//! arrive in any order.

use crate::config::ProtocolConfig;
use crate::error::ClientError;
use crate::events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY};
use crate::transport::UsbTransport;
use badgelink_protocol::message::decode_protocol_version;
use badgelink_protocol::{Command, Decoder, Encoder, Frame, ProtocolError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

type Completion = Result<Frame, ClientError>;

/// A request waiting for its response.
struct PendingTransaction {
    command: Command,
    tx: oneshot::Sender<Completion>,
}

/// The data channel to a badge.
pub struct Connection<T> {
    transport: Arc<T>,
    protocol: ProtocolConfig,
    read_size: usize,
    /// Reassembly buffer for bulk-in data.
    decoder: Mutex<Decoder>,
    /// Transactions waiting for responses, by identifier.
    pending: Mutex<HashMap<u32, PendingTransaction>>,
    next_id: AtomicU32,
    synchronized: AtomicBool,
    listening: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl<T: UsbTransport> Connection<T> {
    pub fn new(transport: Arc<T>, read_size: usize, protocol: ProtocolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            protocol,
            read_size,
            decoder: Mutex::new(Decoder::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            synchronized: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            reader: Mutex::new(None),
            events,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Broadcasts an event. Having no subscribers is fine.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Sends a request and waits for the response payload.
    ///
    /// A zero `timeout` waits indefinitely; otherwise the deadline covers
    /// both the bulk write and the wait. A timeout drops the link out of
    /// sync. A response whose command differs from the request is a device
    /// error.
    pub async fn transact(
        &self,
        command: Command,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let identifier = self.next_id.fetch_add(1, Ordering::SeqCst);
        let encoded = Encoder::encode_request(identifier, command, &payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(identifier, PendingTransaction { command, tx });

        tracing::debug!(identifier, %command, len = payload.len(), "sending request");
        let exchange = self.exchange(encoded.freeze(), rx);
        let result = if timeout.is_zero() {
            exchange.await
        } else {
            match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(identifier, %command, "request timed out");
                    self.synchronized.store(false, Ordering::SeqCst);
                    Err(ClientError::Timeout { command })
                }
            }
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.lock().remove(&identifier);
                return Err(e);
            }
        };

        if frame.command != command {
            tracing::error!(identifier, request = %command, response = %frame.command, "device reports error");
            return Err(ClientError::DeviceError {
                request: command,
                response: frame.command,
            });
        }
        Ok(frame.payload)
    }

    async fn exchange(&self, encoded: Bytes, rx: oneshot::Receiver<Completion>) -> Completion {
        self.transport.bulk_write(encoded).await?;
        match rx.await {
            Ok(completion) => completion,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Feeds bulk-in data to the decoder and dispatches complete frames.
    pub fn handle_data(&self, data: &[u8]) {
        let mut decoded = Vec::new();
        {
            let mut decoder = self.decoder.lock();
            decoder.extend(data);
            loop {
                match decoder.decode_frame() {
                    Ok(Some(frame)) => decoded.push(Ok(frame)),
                    Ok(None) => break,
                    Err(e) => decoded.push(Err(e)),
                }
            }
        }
        for item in decoded {
            self.dispatch(item);
        }
    }

    fn dispatch(&self, decoded: Result<Frame, ProtocolError>) {
        match decoded {
            Ok(frame) => {
                let pending = self.pending.lock().remove(&frame.identifier);
                match pending {
                    Some(transaction) => {
                        tracing::debug!(
                            identifier = frame.identifier,
                            command = %frame.command,
                            len = frame.payload.len(),
                            "response received"
                        );
                        let _ = transaction.tx.send(Ok(frame));
                    }
                    None => {
                        tracing::warn!(
                            identifier = frame.identifier,
                            command = %frame.command,
                            "no pending transaction for response"
                        );
                    }
                }
            }
            Err(ProtocolError::ChecksumMismatch {
                identifier,
                command,
                expected,
                actual,
            }) => {
                self.synchronized.store(false, Ordering::SeqCst);
                let pending = self.pending.lock().remove(&identifier);
                match pending {
                    Some(transaction) => {
                        tracing::warn!(
                            identifier,
                            request = %transaction.command,
                            %command,
                            expected,
                            actual,
                            "checksum mismatch"
                        );
                        let _ = transaction.tx.send(Err(ClientError::ChecksumError { command }));
                    }
                    None => {
                        tracing::warn!(identifier, %command, "checksum mismatch on unknown transaction");
                    }
                }
            }
            Err(e) => {
                tracing::warn!("discarding undecodable frame: {}", e);
            }
        }
    }

    /// Starts the reader task. Replaces a previous one.
    pub fn spawn_read_loop(self: &Arc<Self>) {
        self.listening.store(true, Ordering::SeqCst);
        let connection = Arc::clone(self);
        let handle = tokio::spawn(async move { connection.read_loop().await });
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Reads from the transport until listening stops or the link fails.
    pub async fn read_loop(&self) {
        tracing::debug!("read_loop started");
        while self.listening.load(Ordering::SeqCst) {
            match self.transport.bulk_read(self.read_size).await {
                Ok(data) => {
                    if !self.listening.load(Ordering::SeqCst) {
                        break;
                    }
                    self.handle_data(&data);
                }
                Err(e) => {
                    if self.listening.swap(false, Ordering::SeqCst) {
                        tracing::error!("connection lost: {}", e);
                        self.synchronized.store(false, Ordering::SeqCst);
                        self.fail_pending();
                        self.emit(ConnectionEvent::ConnectionLost {
                            reason: e.to_string(),
                        });
                    }
                    break;
                }
            }
        }
        tracing::debug!("read_loop stopped");
    }

    /// Stops the reader and sends one `SYNC` with identifier 0 so the
    /// outstanding bulk read completes.
    pub async fn stop_listening(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        let wake = Frame::empty(0, Command::SYNC)
            .encode()
            .map(|buf| buf.freeze());
        match wake {
            Ok(bytes) => {
                if let Err(e) = self.transport.bulk_write(bytes).await {
                    tracing::debug!("stop_listening: sync write failed: {}", e);
                }
            }
            Err(e) => tracing::debug!("stop_listening: {}", e),
        }
    }

    /// Stops the reader task, fails every pending transaction and resets
    /// the identifier counter.
    pub fn shutdown(&self) {
        self.listening.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.synchronized.store(false, Ordering::SeqCst);
        self.fail_pending();
        self.reset_identifiers();
        self.decoder.lock().clear();
    }

    /// Issues one `SYNC`. Returns the device's protocol version on success.
    pub async fn sync(&self) -> Option<u16> {
        self.decoder.lock().clear();
        let result = self
            .transact(Command::SYNC, Bytes::new(), self.protocol.sync_timeout())
            .await
            .and_then(|payload| decode_protocol_version(&payload).map_err(ClientError::from));
        match result {
            Ok(version) => {
                self.synchronized.store(true, Ordering::SeqCst);
                tracing::debug!(version, "synchronized");
                Some(version)
            }
            Err(e) => {
                tracing::debug!("sync failed: {}", e);
                None
            }
        }
    }

    /// Syncs until a version is returned, bounded by the sync policy.
    pub async fn resync(&self) -> Result<u16, ClientError> {
        let mut attempts = 0u32;
        loop {
            if !self.is_listening() {
                return Err(ClientError::NotConnected);
            }
            if self.protocol.max_sync_attempts > 0 && attempts >= self.protocol.max_sync_attempts {
                return Err(ClientError::SyncFailed { attempts });
            }
            attempts += 1;
            if let Some(version) = self.sync().await {
                return Ok(version);
            }
            let delay = self.protocol.sync_retry_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Resynchronizes only when a previous failure cleared the flag.
    pub async fn sync_if_needed(&self) -> Result<(), ClientError> {
        if self.is_synchronized() {
            return Ok(());
        }
        self.resync().await.map(|_| ())
    }

    /// Fails every pending transaction with `ConnectionClosed`.
    pub fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!("failing {} pending transactions", drained.len());
        }
        for (_, transaction) in drained {
            let _ = transaction.tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    pub fn reset_identifiers(&self) {
        self.next_id.store(0, Ordering::SeqCst);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Noise bytes dropped by the decoder since creation.
    pub fn discarded_bytes(&self) -> u64 {
        self.decoder.lock().discarded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{corrupted, encode, reply, reply_with, MockTransport};

    fn version_reply(frame: &Frame, version: u16) -> Option<Bytes> {
        Some(reply(frame, version.to_le_bytes().to_vec()))
    }

    async fn connected(mock: MockTransport) -> (Arc<MockTransport>, Arc<Connection<MockTransport>>) {
        let mock = Arc::new(mock);
        mock.open().await.unwrap();
        mock.claim_interface(4).await.unwrap();
        let connection = Arc::new(Connection::new(mock.clone(), 64, ProtocolConfig::default()));
        connection.spawn_read_loop();
        (mock, connection)
    }

    #[tokio::test]
    async fn test_transact_roundtrip() {
        let mock = MockTransport::new().with_responder(|frame| Some(reply(frame, frame.payload.clone())));
        let (mock, connection) = connected(mock).await;

        let payload = connection
            .transact(Command::PING, Bytes::from_static(b"echo"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(payload.as_ref(), b"echo");
        assert_eq!(connection.pending_count(), 0);

        let frames = mock.written_frames();
        assert_eq!(frames[0].identifier, 0);
        assert_eq!(frames[0].command, Command::PING);
    }

    #[tokio::test]
    async fn test_identifiers_increment_and_wrap() {
        let mock = MockTransport::new().with_responder(|frame| Some(reply(frame, Bytes::new())));
        let (mock, connection) = connected(mock).await;

        connection.next_id.store(u32::MAX, Ordering::SeqCst);
        for _ in 0..2 {
            connection
                .transact(Command::PING, Bytes::new(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        let ids: Vec<u32> = mock.written_frames().iter().map(|f| f.identifier).collect();
        assert_eq!(ids, vec![u32::MAX, 0]);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (mock, connection) = connected(MockTransport::new()).await;

        let first = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .transact(Command::FILESYSTEM_EXISTS, Bytes::from_static(b"/a"), Duration::from_secs(2))
                    .await
            })
        };
        let a = mock.next_write().await.unwrap();
        let second = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .transact(Command::FILESYSTEM_EXISTS, Bytes::from_static(b"/b"), Duration::from_secs(2))
                    .await
            })
        };
        let b = mock.next_write().await.unwrap();
        assert_eq!(connection.pending_count(), 2);

        // Answer the second request first, both in one read.
        let mut both = reply(&b, vec![0u8]).to_vec();
        both.extend_from_slice(&reply(&a, vec![1u8]));
        mock.inject(&both);

        assert_eq!(first.await.unwrap().unwrap().as_ref(), &[1u8]);
        assert_eq!(second.await.unwrap().unwrap().as_ref(), &[0u8]);
    }

    #[tokio::test]
    async fn test_split_response_and_noise() {
        let (mock, connection) = connected(MockTransport::new()).await;

        let request = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .transact(Command::PING, Bytes::from_static(b"x"), Duration::from_secs(2))
                    .await
            })
        };
        let frame = mock.next_write().await.unwrap();
        let response = reply(&frame, &b"split response"[..]);

        mock.inject(&[0x00, 0x42, 0x13]);
        mock.inject(&response[..7]);
        tokio::task::yield_now().await;
        mock.inject(&response[7..]);

        assert_eq!(request.await.unwrap().unwrap().as_ref(), b"split response");
        assert_eq!(connection.discarded_bytes(), 3);
    }

    #[tokio::test]
    async fn test_device_error_response() {
        let mock = MockTransport::new().with_responder(|frame| {
            Some(reply_with(frame, Command::from_mnemonic(*b"ERR!"), Bytes::new()))
        });
        let (_mock, connection) = connected(mock).await;

        let result = connection
            .transact(Command::PING, Bytes::new(), Duration::from_secs(1))
            .await;
        match result {
            Err(ClientError::DeviceError { request, response }) => {
                assert_eq!(request, Command::PING);
                assert_eq!(response.to_string(), "ERR!");
            }
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checksum_error_clears_sync() {
        let mock = MockTransport::new().with_responder(|frame| {
            if frame.command == Command::SYNC {
                return version_reply(frame, 2);
            }
            Some(corrupted(&Frame::new(frame.identifier, frame.command, &b"garbled"[..])))
        });
        let (_mock, connection) = connected(mock).await;
        assert_eq!(connection.sync().await, Some(2));
        assert!(connection.is_synchronized());

        let result = connection
            .transact(Command::CONFIGURATION_READ, Bytes::from_static(b"x"), Duration::from_secs(1))
            .await;
        match result {
            Err(ClientError::ChecksumError { command }) => {
                assert_eq!(command, Command::CONFIGURATION_READ)
            }
            other => panic!("expected checksum error, got {:?}", other),
        }
        assert!(!connection.is_synchronized());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_sync_first() {
        let mock = MockTransport::new().with_responder(|frame| {
            if frame.command == Command::SYNC {
                version_reply(frame, 2)
            } else {
                None
            }
        });
        let (mock, connection) = connected(mock).await;
        connection.sync_if_needed().await.unwrap();

        let result = connection
            .transact(Command::FILESYSTEM_LIST, Bytes::from_static(b"/"), Duration::from_millis(4000))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout { command }) if command == Command::FILESYSTEM_LIST));
        assert!(!connection.is_synchronized());
        assert_eq!(connection.pending_count(), 0);

        connection.sync_if_needed().await.unwrap();
        let commands: Vec<Command> = mock.written_frames().iter().map(|f| f.command).collect();
        assert_eq!(commands, vec![Command::SYNC, Command::FILESYSTEM_LIST, Command::SYNC]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_failure_returns_none() {
        let (_mock, connection) = connected(MockTransport::new()).await;
        assert_eq!(connection.sync().await, None);
        assert!(!connection.is_synchronized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_gives_up_after_budget() {
        let mock = Arc::new(MockTransport::new());
        mock.open().await.unwrap();
        mock.claim_interface(4).await.unwrap();
        let protocol = ProtocolConfig {
            max_sync_attempts: 3,
            ..ProtocolConfig::default()
        };
        let connection = Arc::new(Connection::new(mock.clone(), 64, protocol));
        connection.spawn_read_loop();

        let result = connection.sync_if_needed().await;
        assert!(matches!(result, Err(ClientError::SyncFailed { attempts: 3 })));
        assert_eq!(mock.written_frames().len(), 3);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let (mock, connection) = connected(MockTransport::new()).await;
        let mut events = connection.subscribe();

        let request = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .transact(Command::APP_LIST, Bytes::new(), Duration::ZERO)
                    .await
            })
        };
        mock.next_write().await.unwrap();
        mock.sever();

        assert!(matches!(request.await.unwrap(), Err(ClientError::ConnectionClosed)));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::ConnectionLost { .. }
        ));
        assert!(!connection.is_listening());
        assert!(matches!(
            connection.sync_if_needed().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_discarded() {
        let (mock, connection) = connected(MockTransport::new()).await;
        mock.inject(&encode(&Frame::new(99, Command::PING, &b"stray"[..])));

        mock.set_responder(|frame| Some(reply(frame, Bytes::new())));
        connection
            .transact(Command::PING, Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_listening_sends_courtesy_sync() {
        let (mock, connection) = connected(MockTransport::new()).await;
        connection.stop_listening().await;
        connection.stop_listening().await;

        let frames = mock.written_frames();
        assert_eq!(frames, vec![Frame::empty(0, Command::SYNC)]);
        assert!(!connection.is_listening());

        connection.shutdown();
        assert_eq!(connection.pending_count(), 0);
    }
}
