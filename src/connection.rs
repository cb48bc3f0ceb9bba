//! Framed duplex connection.
//!
//! One TCP socket carrying length-prefixed frames in both directions. A
//! reader task decodes inbound frames and dispatches them in arrival
//! order; a writer task drains a bounded per-connection outbox so a slow
//! peer never blocks whoever enqueued the frame.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{encode, FrameDecoder, Message};

/// Outbound frames queued per connection before the writer task drains
/// them. On overflow the oldest queued frame is dropped: a stalled
/// observer skips intermediate values but still converges on the latest.
pub const OUTBOX_CAPACITY: usize = 1024;

const READ_CHUNK_BYTES: usize = 8192;

/// Events a connection owner receives.
///
/// Messages from one connection are dispatched in the order the peer sent
/// them; no ordering holds across connections. `on_closed` fires exactly
/// once, after which sends are rejected.
pub trait ConnectionEvents: Send + Sync + 'static {
    fn on_message(&self, connection_id: Uuid, message: Message);
    fn on_closed(&self, connection_id: Uuid);
}

struct OutboxState {
    queue: VecDeque<Message>,
    closed: bool,
    dropped: u64,
}

struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a frame; returns false once the outbox is closed.
    fn push(&self, message: Message) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.dropped += 1;
                if state.dropped == 1 || state.dropped % 256 == 0 {
                    warn!(dropped = state.dropped, "outbox full, dropping oldest frame");
                }
            }
            state.queue.push_back(message);
        }
        self.notify.notify_one();
        true
    }

    /// Next queued frame; drains remaining frames after close, then None.
    async fn next(&self) -> Option<Message> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.queue.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

struct ConnectionInner {
    id: Uuid,
    peer_addr: SocketAddr,
    outbox: Outbox,
    closed: AtomicBool,
    halves: Mutex<Option<(OwnedReadHalf, OwnedWriteHalf)>>,
}

/// Handle to one framed peer connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an accepted or dialed stream.
    ///
    /// The connection is inert until [`start`](Connection::start) spawns
    /// its tasks, so the owner can register the handle in a roster without
    /// racing the closed event.
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        // Nagle off: frames are small and latency-sensitive.
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                peer_addr,
                outbox: Outbox::new(OUTBOX_CAPACITY),
                closed: AtomicBool::new(false),
                halves: Mutex::new(Some((read_half, write_half))),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Spawn the reader and writer tasks. Subsequent calls are a no-op.
    pub fn start(&self, events: Arc<dyn ConnectionEvents>) {
        let halves = self.inner.halves.lock().take();
        let Some((read_half, write_half)) = halves else {
            return;
        };

        tokio::spawn(write_loop(
            self.inner.clone(),
            events.clone(),
            write_half,
        ));
        tokio::spawn(read_loop(self.inner.clone(), events, read_half));
    }

    /// Enqueue a frame without blocking. Returns false once closed.
    pub fn send(&self, message: Message) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.outbox.push(message)
    }

    /// Close locally: queued frames flush, then the socket shuts down and
    /// the closed event fires.
    pub fn close(&self) {
        self.inner.outbox.close();
    }
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    events: Arc<dyn ConnectionEvents>,
    mut write_half: OwnedWriteHalf,
) {
    while let Some(message) = inner.outbox.next().await {
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&frame).await {
            debug!(error = %err, peer = %inner.peer_addr, "write failed");
            break;
        }
    }

    let _ = write_half.shutdown().await;
    finish_close(&inner, events.as_ref());
}

async fn read_loop(
    inner: Arc<ConnectionInner>,
    events: Arc<dyn ConnectionEvents>,
    mut read_half: OwnedReadHalf,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    'read: loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, peer = %inner.peer_addr, "read failed");
                break;
            }
        };

        decoder.feed(&chunk[..n]);
        loop {
            match decoder.try_next() {
                Ok(Some(message)) => {
                    if inner.closed.load(Ordering::SeqCst) {
                        break 'read;
                    }
                    events.on_message(inner.id, message);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        error = %err,
                        peer = %inner.peer_addr,
                        "malformed frame, closing connection"
                    );
                    break 'read;
                }
            }
        }
    }

    finish_close(&inner, events.as_ref());
}

fn finish_close(inner: &ConnectionInner, events: &dyn ConnectionEvents) {
    inner.outbox.close();
    if !inner.closed.swap(true, Ordering::SeqCst) {
        events.on_closed(inner.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::protocol::Value;

    #[derive(Debug)]
    enum Event {
        Message(Message),
        Closed,
    }

    struct ChannelEvents {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl ConnectionEvents for ChannelEvents {
        fn on_message(&self, _connection_id: Uuid, message: Message) {
            let _ = self.tx.send(Event::Message(message));
        }

        fn on_closed(&self, _connection_id: Uuid) {
            let _ = self.tx.send(Event::Closed);
        }
    }

    async fn connected_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        (Connection::new(dialed), Connection::new(accepted))
    }

    #[tokio::test]
    async fn outbox_drops_oldest_on_overflow() {
        let outbox = Outbox::new(3);
        for i in 0..5i64 {
            assert!(outbox.push(Message::value(format!("k{}", i), Value::Integer(i as i128))));
        }

        // k0 and k1 were dropped to make room.
        assert_eq!(outbox.next().await.unwrap().name(), "k2");
        assert_eq!(outbox.next().await.unwrap().name(), "k3");
        assert_eq!(outbox.next().await.unwrap().name(), "k4");

        outbox.close();
        assert!(outbox.next().await.is_none());
    }

    #[tokio::test]
    async fn outbox_rejects_after_close() {
        let outbox = Outbox::new(3);
        outbox.close();
        assert!(!outbox.push(Message::lost("x")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_arrive_in_send_order() {
        let (client, server) = connected_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.start(Arc::new(ChannelEvents { tx }));
        let (tx_client, _rx_client) = mpsc::unbounded_channel();
        client.start(Arc::new(ChannelEvents { tx: tx_client }));

        for i in 0..10i64 {
            assert!(client.send(Message::value(format!("k{}", i), Value::Integer(i as i128))));
        }

        for i in 0..10i64 {
            let event = timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out")
                .expect("channel open");
            match event {
                Event::Message(message) => assert_eq!(message.name(), format!("k{}", i)),
                Event::Closed => panic!("closed before all messages arrived"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_event_fires_once_on_peer_disconnect() {
        let (client, server) = connected_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.start(Arc::new(ChannelEvents { tx }));
        let (tx_client, _rx_client) = mpsc::unbounded_channel();
        client.start(Arc::new(ChannelEvents { tx: tx_client }));

        client.close();

        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert!(matches!(event, Event::Closed));

        // No further events: the channel just goes quiet, and the handle
        // reports closed after the event was observed.
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert!(!server.send(Message::lost("x")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frame_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let server = Connection::new(accepted);
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.start(Arc::new(ChannelEvents { tx }));

        // Oversized length prefix.
        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert!(matches!(event, Event::Closed));
    }
}
