//! Framing: fixed 43-byte header (guid, type, ttl, hops, BE length) + payload.

use crate::error::{F2fError, Result};
use crate::message::Message;

/// Bytes of guid at the front of every header. Textual UUID, carried verbatim.
pub const GUID_LEN: usize = 36;
/// Fixed header size on the wire.
pub const HEADER_SIZE: usize = GUID_LEN + 1 + 1 + 1 + 4;
/// Hard cap on a single payload. Larger declared lengths kill the connection.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024;

const TYPE_OFFSET: usize = GUID_LEN;
const TTL_OFFSET: usize = GUID_LEN + 1;
const HOPS_OFFSET: usize = GUID_LEN + 2;
const LENGTH_OFFSET: usize = GUID_LEN + 3;

/// Message header kept in its wire layout, so encoding never copies.
///
/// Accessors decode on read; `length()` converts from network order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    bytes: [u8; HEADER_SIZE],
}

impl MessageHeader {
    pub fn new(guid: &[u8; GUID_LEN], msg_type: u8, ttl: u8, hops: u8, length: u32) -> Self {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..GUID_LEN].copy_from_slice(guid);
        bytes[TYPE_OFFSET] = msg_type;
        bytes[TTL_OFFSET] = ttl;
        bytes[HOPS_OFFSET] = hops;
        bytes[LENGTH_OFFSET..].copy_from_slice(&length.to_be_bytes());
        Self { bytes }
    }

    pub fn guid(&self) -> &[u8] {
        &self.bytes[..GUID_LEN]
    }

    pub fn msg_type(&self) -> u8 {
        self.bytes[TYPE_OFFSET]
    }

    pub fn ttl(&self) -> u8 {
        self.bytes[TTL_OFFSET]
    }

    pub fn hops(&self) -> u8 {
        self.bytes[HOPS_OFFSET]
    }

    /// Payload length in host order.
    pub fn length(&self) -> u32 {
        let mut be = [0u8; 4];
        be.copy_from_slice(&self.bytes[LENGTH_OFFSET..]);
        u32::from_be_bytes(be)
    }

    /// Raw header bytes exactly as they go on the wire.
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.bytes
    }

    /// Fails if the declared payload length is over [`MAX_PAYLOAD_LEN`].
    pub fn check_length(&self) -> Result<()> {
        let length = self.length();
        if length > MAX_PAYLOAD_LEN {
            return Err(F2fError::PayloadTooLarge { length });
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHeader")
            .field("guid", &String::from_utf8_lossy(self.guid()))
            .field("type", &self.msg_type())
            .field("ttl", &self.ttl())
            .field("hops", &self.hops())
            .field("length", &self.length())
            .finish()
    }
}

/// Overlay a header on raw bytes. No validation: callers check the length cap.
pub fn decode_header(bytes: &[u8; HEADER_SIZE]) -> MessageHeader {
    MessageHeader { bytes: *bytes }
}

/// Encode a message into one contiguous frame (header + payload).
pub fn encode_frame(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.total_length());
    for buf in msg.encode() {
        out.extend_from_slice(buf);
    }
    out
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Returns `NeedMore` on a partial buffer and `PayloadTooLarge` as soon as the header is readable.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize)> {
    if bytes.len() < HEADER_SIZE {
        return Err(F2fError::NeedMore);
    }
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&bytes[..HEADER_SIZE]);
    let mut msg = Message::from_header(decode_header(&raw))?;
    let len = msg.length() as usize;
    if bytes.len() < HEADER_SIZE + len {
        return Err(F2fError::NeedMore);
    }
    if msg.allocate_payload() > 0 {
        msg.payload_mut()
            .copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + len]);
    }
    Ok((msg, HEADER_SIZE + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: &[u8; GUID_LEN] = b"266695BF-AC15-4991-A01D-21DC180FD4B1";

    #[test]
    fn header_layout_matches_wire_offsets() {
        let h = MessageHeader::new(GUID, 7, 1, 0, 5);
        let raw = h.as_bytes();
        assert_eq!(HEADER_SIZE, 43);
        assert_eq!(&raw[..36], GUID);
        assert_eq!(raw[36], 7);
        assert_eq!(raw[37], 1);
        assert_eq!(raw[38], 0);
        assert_eq!(&raw[39..43], &[0, 0, 0, 5]);
    }

    #[test]
    fn length_is_network_order() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[39..43].copy_from_slice(&[0x00, 0x00, 0x01, 0x02]);
        assert_eq!(decode_header(&raw).length(), 258);
    }

    #[test]
    fn check_length_rejects_over_cap() {
        let ok = MessageHeader::new(GUID, 0, 1, 0, MAX_PAYLOAD_LEN);
        assert!(ok.check_length().is_ok());
        let bad = MessageHeader::new(GUID, 0, 1, 0, 20_000);
        assert!(matches!(
            bad.check_length(),
            Err(F2fError::PayloadTooLarge { length: 20_000 })
        ));
    }

    #[test]
    fn partial_frame_needs_more() {
        let msg = Message::new(GUID, 3, 2, 0, b"query".to_vec()).unwrap();
        let frame = encode_frame(&msg);
        assert!(matches!(
            decode_frame(&frame[..10]),
            Err(F2fError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..HEADER_SIZE + 2]),
            Err(F2fError::NeedMore)
        ));
    }

    #[test]
    fn oversized_header_fails_before_payload_arrives() {
        let raw = MessageHeader::new(GUID, 0, 1, 0, 20_000);
        assert!(matches!(
            decode_frame(raw.as_bytes()),
            Err(F2fError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = Message::new(GUID, 0, 1, 0, Vec::new()).unwrap();
        let b = Message::new(GUID, 7, 1, 0, b"hello".to_vec()).unwrap();
        let mut buf = encode_frame(&a);
        buf.extend_from_slice(&encode_frame(&b));
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, HEADER_SIZE);
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, HEADER_SIZE + 5);
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }
}
