//! Demo handler: admits everyone and answers pings.

use std::sync::{Arc, OnceLock};

use f2f_core::{
    random_guid, types, ConnectionPtr, Message, MessagePtr, Protocol, Router, WeakRouter,
};
use tracing::{info, warn};

/// Pongs take their guid from the attached router, or a random one before `attach`.
#[derive(Default)]
pub struct DemoProtocol {
    router: OnceLock<WeakRouter>,
}

impl DemoProtocol {
    /// Bind to the router that owns this handler. Later calls are ignored.
    pub fn attach(&self, router: &Router) {
        let _ = self.router.set(router.downgrade());
    }

    fn gen_uuid(&self) -> String {
        self.router
            .get()
            .and_then(WeakRouter::upgrade)
            .map(|router| router.gen_uuid())
            .unwrap_or_else(random_guid)
    }
}

impl Protocol for DemoProtocol {
    fn new_incoming_connection(&self, conn: &ConnectionPtr) -> bool {
        info!(conn = %conn, "new incoming connection");
        true
    }

    fn new_outgoing_connection(&self, conn: &ConnectionPtr) {
        info!(conn = %conn, "new outgoing connection");
    }

    fn connection_terminated(&self, conn: &ConnectionPtr) {
        info!(conn = %conn, "connection terminated");
    }

    fn message_received(&self, msg: MessagePtr, conn: &ConnectionPtr) {
        info!(conn = %conn, msg = %msg, "message received");
        match msg.msg_type() {
            types::PING => match Message::pong(self.gen_uuid()) {
                Ok(pong) => {
                    info!(conn = %conn, "got a ping, replying with a pong");
                    conn.enqueue(Arc::new(pong));
                }
                Err(e) => warn!(error = %e, "could not build pong"),
            },
            types::PONG => info!(conn = %conn, "got a pong"),
            other => info!(conn = %conn, msg_type = other, "unhandled message type"),
        }
    }
}
