//! One TCP link to a peer: read loop, FIFO write queue with a single in-flight write, shutdown.
//!
//! Two tasks per started connection. The read task reads a 43-byte header, then exactly
//! `length` payload bytes, hands the message to the top receive callback and loops. The write
//! task pops one message at a time off the queue and writes it fully before popping the next.
//! Both stop when the connection is closed; any I/O error or an over-cap header ends in `fin()`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{F2fError, Result};
use crate::message::{Message, MessagePtr};
use crate::wire::{self, HEADER_SIZE};

pub type ConnectionPtr = Arc<Connection>;
pub type MessageReceivedCb = Arc<dyn Fn(MessagePtr, ConnectionPtr) + Send + Sync>;
pub type ConnectionTerminatedCb = Arc<dyn Fn(ConnectionPtr) + Send + Sync>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Locks are only held to mutate a queue or collection, so a poisoned one is still consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outbound FIFO plus the send-state flag. Only touched under the connection's queue lock.
#[derive(Debug)]
pub(crate) struct WriteQueue {
    queue: VecDeque<MessagePtr>,
    /// Wire bytes of everything queued but not yet handed to the socket.
    size: usize,
    max_size: usize,
    sending: bool,
}

impl WriteQueue {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            size: 0,
            max_size,
            sending: false,
        }
    }

    /// Append at the tail. Returns queued bytes after the push.
    pub(crate) fn push(&mut self, msg: MessagePtr) -> usize {
        self.size += msg.total_length();
        self.queue.push_back(msg);
        self.size
    }

    /// One step of the send loop. `completed` is true when the caller just finished a write.
    ///
    /// Returns the next message to write, or `None` if a write is already in flight
    /// (and this is not its completion) or the queue has drained.
    pub(crate) fn advance(&mut self, completed: bool) -> Option<MessagePtr> {
        if self.sending && !completed {
            return None;
        }
        match self.queue.pop_front() {
            Some(msg) => {
                self.size -= msg.total_length();
                self.sending = true;
                Some(msg)
            }
            None => {
                self.sending = false;
                None
            }
        }
    }
}

/// Peer bookkeeping set by the router or handler. Opaque to the core.
#[derive(Debug, Default)]
struct PeerInfo {
    name: String,
    properties: HashMap<String, String>,
}

pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    runtime: Handle,
    /// Present until `start()` moves the halves into the read/write tasks.
    socket: Mutex<Option<(OwnedReadHalf, OwnedWriteHalf)>>,
    writeq: Mutex<WriteQueue>,
    writer_wake: Notify,
    closed: watch::Sender<bool>,
    shuttingdown: AtomicBool,
    ready: AtomicBool,
    peer: Mutex<PeerInfo>,
    message_received_cbs: Mutex<Vec<MessageReceivedCb>>,
    default_message_received: MessageReceivedCb,
    on_terminated: ConnectionTerminatedCb,
}

impl Connection {
    /// Wrap an established stream. Nothing is read or written until [`Connection::start`].
    pub fn new(
        stream: TcpStream,
        runtime: Handle,
        max_writeq_size: usize,
        default_message_received: MessageReceivedCb,
        on_terminated: ConnectionTerminatedCb,
    ) -> Result<ConnectionPtr> {
        let peer_addr = stream.peer_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            runtime,
            socket: Mutex::new(Some(stream.into_split())),
            writeq: Mutex::new(WriteQueue::new(max_writeq_size)),
            writer_wake: Notify::new(),
            closed,
            shuttingdown: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            peer: Mutex::new(PeerInfo::default()),
            message_received_cbs: Mutex::new(Vec::new()),
            default_message_received,
            on_terminated,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn name(&self) -> String {
        lock(&self.peer).name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        lock(&self.peer).name = name.into();
    }

    /// Property bag lookup.
    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.peer).properties.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.peer).properties.insert(key.into(), value.into());
    }

    pub fn set_properties(&self, properties: HashMap<String, String>) {
        lock(&self.peer).properties.extend(properties);
    }

    /// Whether the handler has passed this peer through its handshake.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shuttingdown.load(Ordering::Acquire)
    }

    /// Wire bytes queued but not yet written.
    pub fn writeq_size(&self) -> usize {
        lock(&self.writeq).size
    }

    pub fn writeq_len(&self) -> usize {
        lock(&self.writeq).queue.len()
    }

    pub fn max_writeq_size(&self) -> usize {
        lock(&self.writeq).max_size
    }

    /// Route inbound messages to `cb` instead of the current target until popped.
    pub fn push_message_received_cb(&self, cb: MessageReceivedCb) {
        lock(&self.message_received_cbs).push(cb);
    }

    pub fn pop_message_received_cb(&self) -> Option<MessageReceivedCb> {
        lock(&self.message_received_cbs).pop()
    }

    /// Queue a message for sending. Returns immediately; delivery is at most once.
    ///
    /// The soft queue cap is only reported, never enforced.
    pub fn enqueue(&self, msg: MessagePtr) {
        if self.is_shutting_down() {
            debug!(conn = %self, msg = %msg, "dropping message for closed connection");
            return;
        }
        let (queued, max) = {
            let mut q = lock(&self.writeq);
            let queued = q.push(msg);
            (queued, q.max_size)
        };
        if queued > max {
            debug!(conn = %self, queued, max, "write queue over soft cap");
        }
        self.writer_wake.notify_one();
    }

    /// Send loop step under the queue lock. `completed` is the message whose write just finished.
    pub(crate) fn drive_send(&self, completed: Option<&MessagePtr>) -> Option<MessagePtr> {
        lock(&self.writeq).advance(completed.is_some())
    }

    /// Spawn the read and write tasks. Messages queued before this are sent first, in order.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_shutting_down() || *self.closed.borrow() {
            return Err(F2fError::ShuttingDown);
        }
        let (reader, writer) = lock(&self.socket).take().ok_or(F2fError::AlreadyStarted)?;
        self.runtime.spawn(Arc::clone(self).read_loop(reader));
        self.runtime.spawn(Arc::clone(self).write_loop(writer));
        Ok(())
    }

    /// Terminate: mark shutting down, notify the owner once, close the socket.
    /// Safe to call any number of times from any thread.
    pub fn fin(self: &Arc<Self>) {
        if self.shuttingdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(conn = %self, "FIN connection");
        (self.on_terminated)(Arc::clone(self));
        self.close();
    }

    /// Close the socket. A started connection still runs `fin()` from its read task.
    pub fn close(&self) {
        self.closed.send_replace(true);
        drop(lock(&self.socket).take());
    }

    fn dispatch(self: &Arc<Self>, msg: MessagePtr) {
        let cb = lock(&self.message_received_cbs)
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_message_received));
        cb(msg, Arc::clone(self));
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut closed = self.closed.subscribe();
        loop {
            let mut raw = [0u8; HEADER_SIZE];
            match read_or_closed(&mut reader, &mut raw, &mut closed).await {
                Some(Ok(())) => {}
                Some(Err(e)) => return self.read_failed(e),
                None => return self.fin(),
            }
            if self.is_shutting_down() {
                return;
            }
            let mut msg = match Message::from_header(wire::decode_header(&raw)) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(conn = %self, error = %e, "protocol violation, dropping peer");
                    return self.fin();
                }
            };
            if msg.allocate_payload() > 0 {
                match read_or_closed(&mut reader, msg.payload_mut(), &mut closed).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => return self.read_failed(e),
                    None => return self.fin(),
                }
                if self.is_shutting_down() {
                    return;
                }
            }
            self.dispatch(Arc::new(msg));
        }
    }

    fn read_failed(self: &Arc<Self>, e: io::Error) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            info!(conn = %self, "peer closed connection");
        } else {
            warn!(conn = %self, error = %e, "read failed");
        }
        self.fin();
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        let mut closed = self.closed.subscribe();
        let mut completed: Option<MessagePtr> = None;
        loop {
            match self.drive_send(completed.take().as_ref()) {
                Some(msg) => {
                    let res = tokio::select! {
                        res = write_message(&mut writer, &msg) => res,
                        _ = closed.wait_for(|closed| *closed) => return,
                    };
                    if let Err(e) = res {
                        warn!(conn = %self, error = %e, "write failed");
                        return self.fin();
                    }
                    completed = Some(msg);
                }
                None => {
                    tokio::select! {
                        _ = self.writer_wake.notified() => {}
                        _ = closed.wait_for(|closed| *closed) => return,
                    }
                }
            }
        }
    }
}

async fn read_or_closed(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    closed: &mut watch::Receiver<bool>,
) -> Option<io::Result<()>> {
    tokio::select! {
        res = reader.read_exact(buf) => Some(res.map(drop)),
        _ = closed.wait_for(|closed| *closed) => None,
    }
}

/// Header then payload, back to back; nothing else touches the write half meanwhile.
async fn write_message(writer: &mut OwnedWriteHalf, msg: &Message) -> io::Result<()> {
    for buf in msg.encode() {
        writer.write_all(buf).await?;
    }
    writer.flush().await
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Connection: '{}' {}]", self.name(), self.peer_addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("name", &self.name())
            .field("shuttingdown", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::random_guid;
    use crate::wire::{decode_frame, MessageHeader};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn msg(msg_type: u8, payload: &[u8]) -> MessagePtr {
        Arc::new(Message::new(random_guid(), msg_type, 1, 0, payload.to_vec()).unwrap())
    }

    /// Loopback pair: (accepted side, dialing side).
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    struct Harness {
        conn: ConnectionPtr,
        peer: TcpStream,
        received: mpsc::UnboundedReceiver<MessagePtr>,
        terminated: Arc<AtomicUsize>,
    }

    async fn harness() -> Harness {
        let (server, peer) = socket_pair().await;
        let (tx, received) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicUsize::new(0));
        let count = terminated.clone();
        let conn = Connection::new(
            server,
            Handle::current(),
            crate::config::DEFAULT_MAX_WRITEQ_SIZE,
            Arc::new(move |m: MessagePtr, _: ConnectionPtr| {
                let _ = tx.send(m);
            }),
            Arc::new(move |_: ConnectionPtr| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        Harness {
            conn,
            peer,
            received,
            terminated,
        }
    }

    #[test]
    fn writeq_is_fifo_with_one_in_flight() {
        let mut q = WriteQueue::new(1024);
        let (a, b, c) = (msg(1, b"a"), msg(2, b"bb"), msg(3, b""));
        q.push(a.clone());
        q.push(b.clone());
        q.push(c.clone());
        assert_eq!(q.size, a.total_length() + b.total_length() + c.total_length());

        let first = q.advance(false).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        // Another kick while a write is in flight is a no-op.
        assert!(q.advance(false).is_none());
        assert_eq!(q.queue.len(), 2);

        let second = q.advance(true).unwrap();
        assert!(Arc::ptr_eq(&second, &b));
        let third = q.advance(true).unwrap();
        assert!(Arc::ptr_eq(&third, &c));
        assert_eq!(q.size, 0);

        assert!(q.advance(true).is_none());
        assert!(!q.sending);
        // Drained to idle, so a fresh kick starts sending again.
        q.push(msg(4, b"d"));
        assert!(q.advance(false).is_some());
    }

    #[tokio::test]
    async fn reads_hello_scenario() {
        let mut h = harness().await;
        h.conn.start().unwrap();
        let guid = random_guid();
        let header = MessageHeader::new(guid.as_bytes().try_into().unwrap(), 7, 1, 0, 5);
        h.peer.write_all(header.as_bytes()).await.unwrap();
        h.peer.write_all(b"hello").await.unwrap();

        let got = tokio::time::timeout(WAIT, h.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload_str(), "hello");
        assert_eq!(got.msg_type(), 7);
        assert_eq!(got.ttl(), 1);
        assert_eq!(got.hops(), 0);
        assert_eq!(got.guid(), guid.as_str());
        assert!(h.received.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_header_terminates_without_reading_payload() {
        let mut h = harness().await;
        h.conn.start().unwrap();
        let guid = random_guid();
        let header = MessageHeader::new(guid.as_bytes().try_into().unwrap(), 0, 1, 0, 20_000);
        h.peer.write_all(header.as_bytes()).await.unwrap();

        // The socket is closed by the connection; we see EOF.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(WAIT, h.peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(h.conn.is_shutting_down());
        assert_eq!(h.terminated.load(Ordering::SeqCst), 1);
        assert!(h.received.try_recv().is_err());
    }

    #[tokio::test]
    async fn writes_frames_in_enqueue_order() {
        let mut h = harness().await;
        let sent = vec![msg(1, b"one"), msg(2, b""), msg(3, b"three")];
        for m in &sent {
            h.conn.enqueue(m.clone());
        }
        assert_eq!(h.conn.writeq_len(), 3);
        h.conn.start().unwrap();

        let expected: usize = sent.iter().map(|m| m.total_length()).sum();
        let mut buf = vec![0u8; expected];
        tokio::time::timeout(WAIT, h.peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let mut offset = 0;
        for m in &sent {
            let (decoded, used) = decode_frame(&buf[offset..]).unwrap();
            assert_eq!(&decoded, m.as_ref());
            offset += used;
        }
        assert_eq!(h.conn.writeq_size(), 0);
    }

    #[tokio::test]
    async fn burst_of_random_sizes_arrives_in_order() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut h = harness().await;
        h.conn.start().unwrap();

        let sent: Vec<MessagePtr> = (0..64u8)
            .map(|i| {
                let len = rng.gen_range(0..=2048);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                msg(i, &payload)
            })
            .collect();
        for m in &sent {
            h.conn.enqueue(m.clone());
        }

        let expected: usize = sent.iter().map(|m| m.total_length()).sum();
        let mut buf = vec![0u8; expected];
        tokio::time::timeout(WAIT, h.peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let mut offset = 0;
        for m in &sent {
            let (decoded, used) = decode_frame(&buf[offset..]).unwrap();
            assert_eq!(decoded.msg_type(), m.msg_type());
            assert_eq!(decoded.payload(), m.payload());
            offset += used;
        }
        assert_eq!(offset, expected);
    }

    #[test]
    fn concurrent_enqueues_keep_frames_whole_and_per_thread_order() {
        const THREADS: u8 = 8;
        const PER_THREAD: u32 = 200;
        let padding = |seq: u32| seq as usize % 97;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let mut h = rt.block_on(harness());
        h.conn.start().unwrap();

        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let conn = h.conn.clone();
                std::thread::spawn(move || {
                    for seq in 0..PER_THREAD {
                        let mut payload = vec![t];
                        payload.extend_from_slice(&seq.to_be_bytes());
                        payload.resize(5 + padding(seq), t);
                        conn.enqueue(msg(t, &payload));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let per_thread: usize = (0..PER_THREAD).map(|seq| HEADER_SIZE + 5 + padding(seq)).sum();
        let mut buf = vec![0u8; per_thread * THREADS as usize];
        rt.block_on(async {
            tokio::time::timeout(WAIT, h.peer.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
        });

        let mut next_seq = vec![0u32; THREADS as usize];
        let mut offset = 0;
        while offset < buf.len() {
            let (m, used) = decode_frame(&buf[offset..]).unwrap();
            let p = m.payload();
            let t = p[0];
            assert_eq!(m.msg_type(), t);
            let seq = u32::from_be_bytes(p[1..5].try_into().unwrap());
            assert_eq!(seq, next_seq[t as usize], "thread {t} out of order");
            assert!(p[5..].iter().all(|&b| b == t));
            next_seq[t as usize] += 1;
            offset += used;
        }
        assert!(next_seq.iter().all(|&n| n == PER_THREAD));
        assert_eq!(h.conn.writeq_len(), 0);
    }

    #[tokio::test]
    async fn fin_twice_notifies_once() {
        let h = harness().await;
        h.conn.start().unwrap();
        h.conn.fin();
        h.conn.fin();
        assert_eq!(h.terminated.load(Ordering::SeqCst), 1);
        assert!(h.conn.is_shutting_down());
        assert!(matches!(h.conn.start(), Err(F2fError::ShuttingDown)));
    }

    #[tokio::test]
    async fn peer_hangup_runs_fin() {
        let h = harness().await;
        h.conn.start().unwrap();
        drop(h.peer);
        tokio::time::timeout(WAIT, async {
            while h.terminated.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.conn.is_shutting_down());
    }

    #[tokio::test]
    async fn pushed_callback_takes_over_until_popped() {
        let mut h = harness().await;
        let (tx, mut diverted) = mpsc::unbounded_channel();
        h.conn.push_message_received_cb(Arc::new(move |m: MessagePtr, _: ConnectionPtr| {
            let _ = tx.send(m);
        }));
        h.conn.start().unwrap();

        let first = msg(2, b"ident");
        h.peer.write_all(&crate::wire::encode_frame(&first)).await.unwrap();
        let got = tokio::time::timeout(WAIT, diverted.recv()).await.unwrap().unwrap();
        assert_eq!(got.payload(), b"ident");

        assert!(h.conn.pop_message_received_cb().is_some());
        let second = msg(3, b"query");
        h.peer.write_all(&crate::wire::encode_frame(&second)).await.unwrap();
        let got = tokio::time::timeout(WAIT, h.received.recv()).await.unwrap().unwrap();
        assert_eq!(got.payload(), b"query");
    }

    #[tokio::test]
    async fn property_bag_and_flags() {
        let h = harness().await;
        assert!(!h.conn.ready());
        h.conn.set_ready(true);
        assert!(h.conn.ready());
        h.conn.set_name("alice");
        h.conn.set("username", "alice");
        assert_eq!(h.conn.get("username").as_deref(), Some("alice"));
        assert_eq!(h.conn.get("missing"), None);
        assert!(h.conn.to_string().starts_with("[Connection: 'alice' 127.0.0.1:"));
    }

    #[tokio::test]
    async fn enqueue_after_fin_is_dropped() {
        let h = harness().await;
        h.conn.fin();
        h.conn.enqueue(msg(0, b""));
        assert_eq!(h.conn.writeq_len(), 0);
    }
}
