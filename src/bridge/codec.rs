//! Bridge frame encoding and decoding
//!
//! Every message on the bridge link is one frame: a fixed header
//! (type, flag, client ID, connection ID, server type), a reserved list of
//! TLV extension slots, and an opaque payload. This module is the only
//! place that knows the byte layout; everything else round-trips through
//! [`encode`] and [`decode`].
//!
//! # Wire Layout
//!
//! ```text
//! +------+------+-------------+--------------+-----------+
//! | type | flag | server_type | client_id    | conn_id   |
//! +------+------+-------------+--------------+-----------+
//! |  1B  |  1B  |     1B      | 2B len + str | 2B len+str|
//! +------+------+-------------+--------------+-----------+
//! | ext_count | ext_count * (1B type, 2B len, bytes)     |
//! +-----------+------------------------------------------+
//! | payload_len (4B) | payload                           |
//! +------------------+-----------------------------------+
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// Bridge frame type constants
pub mod frame_type {
    /// Open a proxied connection toward the target carried in the payload
    pub const CONNECT: u8 = 0x00;
    /// Remote peer's answer to a Connect
    pub const CONNECT_ACK: u8 = 0x02;
    /// Opaque session bytes
    pub const DATA: u8 = 0x04;
    /// Orderly session teardown
    pub const CLOSE: u8 = 0x08;
    /// Session teardown with an error condition
    pub const ERROR: u8 = 0x0F;
}

/// Bridge frame direction flags
pub mod frame_flag {
    /// Frame travels from this proxy toward the remote peer
    pub const TO_SERVER: u8 = 0x0A;
    /// Frame travels from the remote peer toward this proxy
    pub const TO_CLIENT: u8 = 0x0F;
}

/// Decoded frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type byte (see [`frame_type`])
    pub frame_type: u8,
    /// Direction flag (see [`frame_flag`])
    pub flag: u8,
    /// Identifier of the proxy instance this frame belongs to
    pub client_id: String,
    /// Session identifier the frame is multiplexed for
    pub conn_id: String,
    /// Remote server class selector
    pub server_type: u8,
}

/// Reserved TLV extension slot
///
/// Unused today; decoders must carry these through losslessly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameExtension {
    pub ext_type: u8,
    pub data: Vec<u8>,
}

/// A decoded bridge frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub extensions: Vec<FrameExtension>,
    pub payload: Vec<u8>,
}

/// Encode a frame into its wire bytes
///
/// `payload` must be present: `None` is an error, while `Some(&[])` is a
/// legal present-but-empty payload.
///
/// # Errors
///
/// Returns [`CodecError::MissingPayload`] when `payload` is `None`.
pub fn encode(
    frame_type: u8,
    flag: u8,
    client_id: &str,
    conn_id: &str,
    server_type: u8,
    payload: Option<&[u8]>,
) -> Result<Vec<u8>, CodecError> {
    let payload = payload.ok_or(CodecError::MissingPayload)?;

    let mut buf = BytesMut::with_capacity(
        3 + 2 + client_id.len() + 2 + conn_id.len() + 1 + 4 + payload.len(),
    );
    buf.put_u8(frame_type);
    buf.put_u8(flag);
    buf.put_u8(server_type);
    buf.put_u16(client_id.len() as u16);
    buf.put_slice(client_id.as_bytes());
    buf.put_u16(conn_id.len() as u16);
    buf.put_slice(conn_id.as_bytes());
    buf.put_u8(0); // no extension slots emitted yet
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.to_vec())
}

/// Decode wire bytes into a [`Frame`]
///
/// # Errors
///
/// Returns [`CodecError::EmptyInput`] for empty input and
/// [`CodecError::Truncated`] when any field is cut short.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    let mut buf = bytes;
    if buf.remaining() < 3 {
        return Err(CodecError::Truncated("header"));
    }
    let frame_type = buf.get_u8();
    let flag = buf.get_u8();
    let server_type = buf.get_u8();

    let client_id = read_string(&mut buf, "client_id")?;
    let conn_id = read_string(&mut buf, "conn_id")?;

    if buf.remaining() < 1 {
        return Err(CodecError::Truncated("extension count"));
    }
    let ext_count = buf.get_u8() as usize;
    let mut extensions = Vec::with_capacity(ext_count);
    for _ in 0..ext_count {
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated("extension header"));
        }
        let ext_type = buf.get_u8();
        let ext_len = buf.get_u16() as usize;
        if buf.remaining() < ext_len {
            return Err(CodecError::Truncated("extension data"));
        }
        let data = buf[..ext_len].to_vec();
        buf.advance(ext_len);
        extensions.push(FrameExtension { ext_type, data });
    }

    if buf.remaining() < 4 {
        return Err(CodecError::Truncated("payload length"));
    }
    let payload_len = buf.get_u32() as usize;
    if buf.remaining() < payload_len {
        return Err(CodecError::Truncated("payload"));
    }
    let payload = buf[..payload_len].to_vec();

    Ok(Frame {
        header: FrameHeader {
            frame_type,
            flag,
            client_id,
            conn_id,
            server_type,
        },
        extensions,
        payload,
    })
}

fn read_string(buf: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated(field));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| CodecError::InvalidUtf8(field))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// Control notification embedded in Connect/ConnectAck/Close/Error payloads
///
/// ```text
/// +------+--------------+--------------+------+------+
/// | code | message      | addr         | port | atyp |
/// +------+--------------+--------------+------+------+
/// |  4B  | 2B len + str | 2B len + str |  2B  |  1B  |
/// +------+--------------+--------------+------+------+
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    /// 0 means success; anything else is a failure code
    pub code: i32,
    /// Human-readable detail, may be empty
    pub message: String,
    /// Target host the notification refers to
    pub addr: String,
    /// Target port
    pub port: u16,
    /// SOCKS5 address-type byte of `addr`
    pub atyp: u8,
}

impl Notification {
    /// Encode the notification into payload bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            BytesMut::with_capacity(4 + 2 + self.message.len() + 2 + self.addr.len() + 3);
        buf.put_i32(self.code);
        buf.put_u16(self.message.len() as u16);
        buf.put_slice(self.message.as_bytes());
        buf.put_u16(self.addr.len() as u16);
        buf.put_slice(self.addr.as_bytes());
        buf.put_u16(self.port);
        buf.put_u8(self.atyp);
        buf.to_vec()
    }

    /// Decode a notification from payload bytes
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the record is empty or truncated.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::EmptyInput);
        }

        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(CodecError::Truncated("notification code"));
        }
        let code = buf.get_i32();
        let message = read_string(&mut buf, "notification message")?;
        let addr = read_string(&mut buf, "notification addr")?;
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated("notification port"));
        }
        let port = buf.get_u16();
        let atyp = buf.get_u8();

        Ok(Self {
            code,
            message,
            addr,
            port,
            atyp,
        })
    }
}
