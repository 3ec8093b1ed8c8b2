//! Application handler seam: the router calls into this for admission and dispatch.

use tracing::{debug, info};

use crate::connection::ConnectionPtr;
use crate::message::MessagePtr;

/// Callbacks the router invokes. Called from reactor tasks: implementations must not block.
///
/// Every method has a default, so a handler only overrides what it cares about.
pub trait Protocol: Send + Sync + 'static {
    /// A peer connected to us. Return `false` to reject; the connection is then dropped unregistered.
    fn new_incoming_connection(&self, conn: &ConnectionPtr) -> bool {
        info!(conn = %conn, "new incoming connection");
        true
    }

    /// We opened a connection to a remote servent. Called before it is registered.
    fn new_outgoing_connection(&self, conn: &ConnectionPtr) {
        info!(conn = %conn, "new outgoing connection");
    }

    /// Called exactly once per registered connection, after it has been unregistered.
    fn connection_terminated(&self, conn: &ConnectionPtr) {
        info!(conn = %conn, "connection terminated");
    }

    /// A message survived router filtering.
    fn message_received(&self, msg: MessagePtr, conn: &ConnectionPtr) {
        debug!(conn = %conn, msg = %msg, "message received");
    }
}

/// Handler that admits everything and only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProtocol;

impl Protocol for LoggingProtocol {}
