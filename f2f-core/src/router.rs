//! Router (aka servent): owns the listener and the set of live connections.
//!
//! A connection is registered once it is established (accepted and admitted by the handler,
//! or dialed successfully) and unregistered by its own `fin()`. Handlers and the command
//! thread reach every peer through `broadcast` / `for_each` / `lookup_by_name`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::connection::{lock, Connection, ConnectionPtr, MessageReceivedCb};
use crate::error::{F2fError, Result};
use crate::message::{random_guid, MessagePtr};
use crate::protocol::Protocol;
use crate::wire::MAX_PAYLOAD_LEN;

/// Messages that have travelled more than this many hops are dropped on arrival.
pub const MAX_HOPS: u8 = 3;

pub type UuidGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Cheap to clone; all clones drive the same connection set.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// See [`Router::downgrade`].
#[derive(Clone, Default)]
pub struct WeakRouter {
    inner: Weak<RouterInner>,
}

impl WeakRouter {
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

struct RouterInner {
    connections: Mutex<Vec<ConnectionPtr>>,
    handler: Arc<dyn Protocol>,
    config: RouterConfig,
    runtime: Handle,
    local_addr: Option<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    seen_connections: AtomicU64,
    uuid_gen: Mutex<UuidGenerator>,
}

impl Router {
    /// Take over `listener` and start accepting. Must be called inside a tokio runtime.
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn Protocol>,
        config: RouterConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| F2fError::NoRuntime)?;
        let local_addr = listener.local_addr().ok();
        let router = Self::build(handler, config, runtime, local_addr);
        let task = router
            .inner
            .runtime
            .spawn(accept_loop(Arc::downgrade(&router.inner), listener));
        *lock(&router.inner.accept_task) = Some(task);
        info!(addr = ?local_addr, "router listening");
        Ok(router)
    }

    /// Bind a listener on `addr` and start accepting.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn Protocol>,
        config: RouterConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, handler, config)
    }

    /// A router that only dials out.
    pub fn without_listener(handler: Arc<dyn Protocol>, config: RouterConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| F2fError::NoRuntime)?;
        Ok(Self::build(handler, config, runtime, None))
    }

    fn build(
        handler: Arc<dyn Protocol>,
        config: RouterConfig,
        runtime: Handle,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        let uuid_gen: UuidGenerator = Arc::new(random_guid);
        Self {
            inner: Arc::new(RouterInner {
                connections: Mutex::new(Vec::new()),
                handler,
                config,
                runtime,
                local_addr,
                accept_task: Mutex::new(None),
                seen_connections: AtomicU64::new(0),
                uuid_gen: Mutex::new(uuid_gen),
            }),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Number of sockets accepted so far, admitted or not.
    pub fn seen_connections(&self) -> u64 {
        self.inner.seen_connections.load(Ordering::Relaxed)
    }

    /// Replace the guid source used by [`Router::gen_uuid`].
    pub fn set_uuid_generator(&self, uuid_gen: UuidGenerator) {
        *lock(&self.inner.uuid_gen) = uuid_gen;
    }

    /// Non-owning handle, for handlers that need to reach back into their router.
    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn gen_uuid(&self) -> String {
        let uuid_gen = Arc::clone(&lock(&self.inner.uuid_gen));
        uuid_gen()
    }

    /// Dial a remote servent. On success the handler hears `new_outgoing_connection`, then the
    /// connection is registered and its read loop started. Failures are logged; the handle
    /// only reports the outcome.
    pub fn connect_to_remote(
        &self,
        endpoint: SocketAddr,
        properties: HashMap<String, String>,
    ) -> JoinHandle<Result<ConnectionPtr>> {
        info!(peer = %endpoint, "connecting to remote servent");
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let stream = match TcpStream::connect(endpoint).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(peer = %endpoint, error = %e, "failed to connect out to remote servent");
                    return Err(e.into());
                }
            };
            let conn = inner.new_connection(stream).map_err(|e| {
                warn!(peer = %endpoint, error = %e, "connection lost before registration");
                e
            })?;
            conn.set_properties(properties);
            inner.handler.new_outgoing_connection(&conn);
            if !inner.register(&conn) {
                return Err(F2fError::ShuttingDown);
            }
            if let Err(e) = conn.start() {
                inner.unregister(&conn);
                return Err(e);
            }
            Ok(conn)
        })
    }

    /// Add to the live set. Returns `false` for a connection that already terminated.
    pub fn register(&self, conn: &ConnectionPtr) -> bool {
        self.inner.register(conn)
    }

    pub fn unregister(&self, conn: &ConnectionPtr) {
        self.inner.unregister(conn);
    }

    /// Target of every connection's `fin()`: unregister, then tell the handler.
    pub fn connection_terminated(&self, conn: &ConnectionPtr) {
        self.inner.connection_terminated(conn);
    }

    /// Default receive path: flood and size filtering, then the handler.
    pub fn default_message_received(&self, msg: MessagePtr, conn: &ConnectionPtr) {
        self.inner.default_message_received(msg, conn);
    }

    /// Enqueue the same message on every live connection. The message must not change afterwards.
    pub fn broadcast(&self, msg: MessagePtr) {
        self.for_each(|conn| conn.enqueue(Arc::clone(&msg)));
    }

    /// Visit every live connection under the set lock. The visitor must not call `fin()`,
    /// `register` or `unregister`; queueing messages is fine.
    pub fn for_each<F: FnMut(&ConnectionPtr)>(&self, mut f: F) {
        let conns = lock(&self.inner.connections);
        for conn in conns.iter() {
            f(conn);
        }
    }

    /// Like [`Router::for_each`], skipping `excluded`.
    pub fn for_each_except<F: FnMut(&ConnectionPtr)>(&self, mut f: F, excluded: &ConnectionPtr) {
        let conns = lock(&self.inner.connections);
        for conn in conns.iter().filter(|c| !Arc::ptr_eq(c, excluded)) {
            f(conn);
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<ConnectionPtr> {
        lock(&self.inner.connections)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live set.
    pub fn connections(&self) -> Vec<ConnectionPtr> {
        lock(&self.inner.connections).clone()
    }

    pub fn connections_str(&self) -> String {
        let mut out = String::from("<connections>\n");
        self.for_each(|conn| {
            out.push_str(&conn.to_string());
            out.push('\n');
        });
        out.push_str("</connections>");
        out
    }

    /// Terminate every registered connection. Not a drain: queued messages are lost.
    pub fn stop(&self) {
        loop {
            let first = lock(&self.inner.connections).first().cloned();
            let Some(conn) = first else { break };
            conn.fin();
            // Covers a connection whose fin() is already running on another thread.
            self.inner.unregister(&conn);
        }
        info!("router stopped, all connections terminated");
    }

    /// Stop accepting, then [`Router::stop`].
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.inner.accept_task).take() {
            task.abort();
        }
        self.stop();
    }
}

impl RouterInner {
    /// Wrap a fresh socket. Callbacks hold a weak router so connections never keep it alive.
    fn new_connection(self: &Arc<Self>, stream: TcpStream) -> Result<ConnectionPtr> {
        let on_message = Arc::downgrade(self);
        let on_terminated = Arc::downgrade(self);
        let default_message_received: MessageReceivedCb = Arc::new(move |msg, conn| {
            if let Some(router) = on_message.upgrade() {
                router.default_message_received(msg, &conn);
            }
        });
        Connection::new(
            stream,
            self.runtime.clone(),
            self.config.max_writeq_size,
            default_message_received,
            Arc::new(move |conn| {
                if let Some(router) = on_terminated.upgrade() {
                    router.connection_terminated(&conn);
                }
            }),
        )
    }

    fn handle_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        self.seen_connections.fetch_add(1, Ordering::Relaxed);
        let conn = match self.new_connection(stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %addr, error = %e, "dropping accepted socket");
                return;
            }
        };
        if !self.handler.new_incoming_connection(&conn) {
            // Never registered, so the socket closes when `conn` drops.
            debug!(conn = %conn, "rejecting connection");
            return;
        }
        if !self.register(&conn) {
            return;
        }
        if let Err(e) = conn.start() {
            warn!(conn = %conn, error = %e, "could not start connection");
            self.unregister(&conn);
        }
    }

    fn register(&self, conn: &ConnectionPtr) -> bool {
        let mut conns = lock(&self.connections);
        // Under the set lock, so a racing fin() either finds the entry or is refused here.
        if conn.is_shutting_down() {
            debug!(conn = %conn, "not registering terminated connection");
            return false;
        }
        if conns.iter().any(|c| Arc::ptr_eq(c, conn)) {
            error!(conn = %conn, "connection already registered");
            debug_assert!(false, "connection registered twice");
            return false;
        }
        conns.push(Arc::clone(conn));
        info!(conn = %conn, live = conns.len(), "registered connection");
        true
    }

    fn unregister(&self, conn: &ConnectionPtr) {
        let mut conns = lock(&self.connections);
        let before = conns.len();
        conns.retain(|c| !Arc::ptr_eq(c, conn));
        if conns.len() != before {
            info!(conn = %conn, live = conns.len(), "unregistered connection");
        }
    }

    fn connection_terminated(&self, conn: &ConnectionPtr) {
        self.unregister(conn);
        self.handler.connection_terminated(conn);
    }

    fn default_message_received(&self, msg: MessagePtr, conn: &ConnectionPtr) {
        debug!(conn = %conn, msg = %msg, "router received message");
        if msg.hops() > MAX_HOPS {
            debug!(conn = %conn, hops = msg.hops(), "dropping, hop count");
            return;
        }
        if msg.length() > MAX_PAYLOAD_LEN {
            debug!(conn = %conn, length = msg.length(), "dropping, msg length");
            return;
        }
        self.handler.message_received(msg, conn);
    }
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        let task = self
            .accept_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Accept until the listener fails or the router goes away. An accept error ends the
/// loop without re-arming, so the router stops listening.
async fn accept_loop(router: Weak<RouterInner>, listener: TcpListener) {
    loop {
        let accepted = listener.accept().await;
        let Some(inner) = router.upgrade() else {
            debug!("router dropped, accept loop exiting");
            return;
        };
        match accepted {
            Ok((stream, addr)) => inner.handle_accept(stream, addr),
            Err(e) => {
                error!(error = %e, "accept failed, no longer listening");
                return;
            }
        }
    }
}
