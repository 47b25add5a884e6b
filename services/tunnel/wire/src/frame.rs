//! Frame structure and encoding/decoding.
//!
//! A frame is the unit written atomically onto the transport. Data payloads
//! are kept as `Bytes` slices of the incoming message, so large payloads are
//! never copied during decode.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum length of a connect proto string ("tcp", "unix", ...)
pub const MAX_PROTO_LEN: usize = 64;

/// Maximum length of a connect address string
pub const MAX_ADDRESS_LEN: usize = 4 * 1024;

/// Fixed header size: type byte + connection ID
const HEADER_SIZE: usize = 1 + 8;

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Open a new virtual connection
    Connect = 0x00,
    /// Payload bytes for an open virtual connection
    Data = 0x01,
    /// Close a virtual connection, carrying the reason
    Error = 0x02,
    /// Keepalive probe
    Ping = 0x03,
    /// Keepalive reply
    Pong = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x00 => Ok(FrameType::Connect),
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Error),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            _ => Err(WireError::UnknownType(value)),
        }
    }
}

/// Connect frame body: what to dial on the receiving side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Dial protocol, e.g. "tcp" or "unix"
    pub proto: String,
    /// Dial address, e.g. "10.0.0.5:80" or "/run/agent.sock"
    pub address: String,
    /// Bound on the receiver's local dial attempt, in milliseconds (0 = none)
    pub deadline_ms: u64,
}

/// Type-specific frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Open a virtual connection
    Connect(ConnectRequest),
    /// Opaque payload for an open virtual connection
    Data(Bytes),
    /// Close a virtual connection with a reason
    Error(String),
    /// Keepalive probe
    Ping,
    /// Keepalive reply
    Pong,
}

impl FrameBody {
    /// The frame type tag for this body
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::Connect(_) => FrameType::Connect,
            FrameBody::Data(_) => FrameType::Data,
            FrameBody::Error(_) => FrameType::Error,
            FrameBody::Ping => FrameType::Ping,
            FrameBody::Pong => FrameType::Pong,
        }
    }
}

/// One wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Connection ID, scoped to the owning session (0 for keepalive)
    pub conn_id: u64,
    /// Type-specific body
    pub body: FrameBody,
}

impl Frame {
    /// Build a Connect frame
    pub fn connect(conn_id: u64, proto: &str, address: &str, deadline_ms: u64) -> Self {
        Self {
            conn_id,
            body: FrameBody::Connect(ConnectRequest {
                proto: proto.to_string(),
                address: address.to_string(),
                deadline_ms,
            }),
        }
    }

    /// Build a Data frame
    pub fn data(conn_id: u64, payload: Bytes) -> Self {
        Self {
            conn_id,
            body: FrameBody::Data(payload),
        }
    }

    /// Build an Error frame
    pub fn error(conn_id: u64, message: &str) -> Self {
        Self {
            conn_id,
            body: FrameBody::Error(message.to_string()),
        }
    }

    /// Build a Ping frame (conn id 0 is never allocated to a connection)
    pub fn ping() -> Self {
        Self {
            conn_id: 0,
            body: FrameBody::Ping,
        }
    }

    /// Build a Pong frame
    pub fn pong() -> Self {
        Self {
            conn_id: 0,
            body: FrameBody::Pong,
        }
    }

    /// Encode this frame into one transport message
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body_len = match &self.body {
            FrameBody::Connect(c) => {
                if c.proto.len() > MAX_PROTO_LEN {
                    return Err(WireError::FieldTooLong {
                        field: "proto",
                        limit: MAX_PROTO_LEN,
                    });
                }
                if c.address.len() > MAX_ADDRESS_LEN {
                    return Err(WireError::FieldTooLong {
                        field: "address",
                        limit: MAX_ADDRESS_LEN,
                    });
                }
                2 + c.proto.len() + 2 + c.address.len() + 8
            }
            FrameBody::Data(payload) => payload.len(),
            FrameBody::Error(message) => message.len(),
            FrameBody::Ping | FrameBody::Pong => 0,
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
        buf.put_u8(self.body.frame_type() as u8);
        buf.put_u64(self.conn_id);

        match &self.body {
            FrameBody::Connect(c) => {
                buf.put_u16(c.proto.len() as u16);
                buf.put_slice(c.proto.as_bytes());
                buf.put_u16(c.address.len() as u16);
                buf.put_slice(c.address.as_bytes());
                buf.put_u64(c.deadline_ms);
            }
            FrameBody::Data(payload) => buf.put_slice(payload),
            FrameBody::Error(message) => buf.put_slice(message.as_bytes()),
            FrameBody::Ping | FrameBody::Pong => {}
        }

        Ok(buf.freeze())
    }

    /// Decode one transport message into a frame.
    ///
    /// Data payloads are returned as a slice of `message` without copying.
    pub fn decode(mut message: Bytes) -> Result<Frame, WireError> {
        if message.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }

        let typ = FrameType::try_from(message.get_u8())?;
        let conn_id = message.get_u64();

        let body = match typ {
            FrameType::Connect => {
                let proto = take_string(&mut message, "proto", MAX_PROTO_LEN)?;
                let address = take_string(&mut message, "address", MAX_ADDRESS_LEN)?;
                if message.len() < 8 {
                    return Err(WireError::Truncated);
                }
                let deadline_ms = message.get_u64();
                FrameBody::Connect(ConnectRequest {
                    proto,
                    address,
                    deadline_ms,
                })
            }
            FrameType::Data => FrameBody::Data(message),
            FrameType::Error => {
                let text = std::str::from_utf8(&message).map_err(|_| WireError::Utf8("error"))?;
                FrameBody::Error(text.to_string())
            }
            FrameType::Ping => FrameBody::Ping,
            FrameType::Pong => FrameBody::Pong,
        };

        Ok(Frame { conn_id, body })
    }
}

/// Read one u16-length-prefixed UTF-8 string out of the buffer
fn take_string(buf: &mut Bytes, field: &'static str, limit: usize) -> Result<String, WireError> {
    if buf.len() < 2 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if len > limit {
        return Err(WireError::FieldTooLong { field, limit });
    }
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    let raw = buf.split_to(len);
    let text = std::str::from_utf8(&raw).map_err(|_| WireError::Utf8(field))?;
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let encoded = frame.encode().unwrap();
        Frame::decode(encoded).unwrap()
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x00).unwrap(), FrameType::Connect);
        assert_eq!(FrameType::try_from(0x04).unwrap(), FrameType::Pong);
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_connect_roundtrip() {
        let frame = Frame::connect(7, "tcp", "10.0.0.5:80", 15_000);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_connect_unix_roundtrip() {
        let frame = Frame::connect(1, "unix", "/run/kubelet/kubelet.sock", 0);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_data_roundtrip() {
        let frame = Frame::data(42, Bytes::from_static(b"hello tunnel"));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_large_data_roundtrip() {
        let payload = Bytes::from(vec![0xAB; 4 * 1024 * 1024]);
        let frame = Frame::data(9, payload.clone());
        let decoded = roundtrip(frame);
        match decoded.body {
            FrameBody::Data(p) => assert_eq!(p, payload),
            other => panic!("expected data body, got {:?}", other),
        }
    }

    #[test]
    fn test_error_roundtrip() {
        let frame = Frame::error(5, "dial tcp 10.0.0.5:80: connection refused");
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        assert_eq!(roundtrip(Frame::ping()), Frame::ping());
        assert_eq!(roundtrip(Frame::pong()), Frame::pong());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut raw = Frame::ping().encode().unwrap().to_vec();
        raw[0] = 0x7F;
        assert!(matches!(
            Frame::decode(Bytes::from(raw)),
            Err(WireError::UnknownType(0x7F))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x01, 0x00])),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn test_truncated_connect_rejected() {
        let encoded = Frame::connect(3, "tcp", "127.0.0.1:8080", 5000)
            .encode()
            .unwrap();
        let cut = encoded.slice(0..encoded.len() - 4);
        assert!(matches!(Frame::decode(cut), Err(WireError::Truncated)));
    }

    #[test]
    fn test_oversize_address_rejected() {
        let address = "a".repeat(MAX_ADDRESS_LEN + 1);
        let err = Frame::connect(3, "tcp", &address, 0).encode().unwrap_err();
        assert!(matches!(err, WireError::FieldTooLong { field: "address", .. }));
    }

    #[test]
    fn test_invalid_utf8_error_rejected() {
        let mut raw = Frame::error(1, "x").encode().unwrap().to_vec();
        *raw.last_mut().unwrap() = 0xFF;
        assert!(matches!(
            Frame::decode(Bytes::from(raw)),
            Err(WireError::Utf8("error"))
        ));
    }

    #[test]
    fn test_empty_data_payload() {
        let frame = Frame::data(11, Bytes::new());
        assert_eq!(roundtrip(frame.clone()), frame);
    }
}
