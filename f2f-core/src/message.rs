//! Message: one header plus its exclusively owned payload.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::{F2fError, Result};
use crate::wire::{MessageHeader, GUID_LEN, HEADER_SIZE};

/// Messages are shared read-only once queued (broadcast enqueues the same one everywhere).
pub type MessagePtr = Arc<Message>;

/// Well-known message types used by the demo protocol. The core never dispatches on these.
pub mod types {
    pub const PING: u8 = 0;
    pub const PONG: u8 = 1;
    pub const IDENT: u8 = 2;
    pub const QUERY: u8 = 3;
    pub const QUERYRESULT: u8 = 4;
    pub const QUERYCANCEL: u8 = 5;
    pub const SIDREQUEST: u8 = 6;
    pub const SIDDATA: u8 = 7;
    pub const SIDCANCEL: u8 = 8;
    pub const BYE: u8 = 9;
}

/// Fresh random guid in hyphenated textual form (exactly [`GUID_LEN`] bytes).
pub fn random_guid() -> String {
    uuid::Uuid::new_v4().hyphenated().to_string().to_uppercase()
}

#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    payload: Vec<u8>,
}

impl Message {
    /// Build an outbound message. `guid` must be exactly 36 bytes; payload at most 16 KiB.
    pub fn new(
        guid: impl AsRef<[u8]>,
        msg_type: u8,
        ttl: u8,
        hops: u8,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let guid: &[u8; GUID_LEN] = guid
            .as_ref()
            .try_into()
            .map_err(|_| F2fError::InvalidGuid(guid.as_ref().len()))?;
        let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        let header = MessageHeader::new(guid, msg_type, ttl, hops, length);
        header.check_length()?;
        Ok(Self { header, payload })
    }

    /// Message with a known header and a zeroed payload of the declared length.
    /// Refuses over-cap lengths.
    pub fn from_header(header: MessageHeader) -> Result<Self> {
        header.check_length()?;
        let mut msg = Self {
            header,
            payload: Vec::new(),
        };
        msg.allocate_payload();
        Ok(msg)
    }

    pub fn ping(guid: impl AsRef<[u8]>) -> Result<Self> {
        Self::new(guid, types::PING, 1, 0, Vec::new())
    }

    pub fn pong(guid: impl AsRef<[u8]>) -> Result<Self> {
        Self::new(guid, types::PONG, 1, 0, Vec::new())
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn guid_bytes(&self) -> &[u8] {
        self.header.guid()
    }

    pub fn guid(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.header.guid())
    }

    pub fn msg_type(&self) -> u8 {
        self.header.msg_type()
    }

    pub fn ttl(&self) -> u8 {
        self.header.ttl()
    }

    pub fn hops(&self) -> u8 {
        self.header.hops()
    }

    /// Declared payload length, host order.
    pub fn length(&self) -> u32 {
        self.header.length()
    }

    /// Header plus payload size on the wire.
    pub fn total_length(&self) -> usize {
        HEADER_SIZE + self.length() as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Size the payload buffer to the header's length. Returns that size, 0 for no payload.
    pub fn allocate_payload(&mut self) -> usize {
        let len = self.length() as usize;
        if self.payload.len() != len {
            self.payload = vec![0u8; len];
        }
        len
    }

    /// Wire representation as borrowed buffers: header, then payload if non-empty.
    pub fn encode(&self) -> Vec<&[u8]> {
        let mut buffers: Vec<&[u8]> = vec![self.header.as_bytes()];
        if self.length() > 0 {
            buffers.push(&self.payload);
        }
        buffers
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Msg type:{} ttl:{} hops:{} length:{} guid:{}]",
            self.msg_type(),
            self.ttl(),
            self.hops(),
            self.length(),
            self.guid()
        )
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
