//! Friend-to-friend networking core.
//! Framed TCP connections with ordered write queues, plus a router that accepts, dials,
//! filters and fans messages out. Application behaviour plugs in through [`Protocol`].

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod router;
pub mod wire;

pub use config::RouterConfig;
pub use connection::{Connection, ConnectionPtr, MessageReceivedCb};
pub use error::{F2fError, Result};
pub use message::{random_guid, types, Message, MessagePtr};
pub use protocol::{LoggingProtocol, Protocol};
pub use router::{Router, UuidGenerator, WeakRouter, MAX_HOPS};
pub use wire::{decode_frame, encode_frame, MessageHeader, GUID_LEN, HEADER_SIZE, MAX_PAYLOAD_LEN};
