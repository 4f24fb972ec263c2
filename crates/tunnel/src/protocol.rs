//! Binary framing spoken between the edge server and tunnel clients.
//!
//! Each frame is one transport message: a type byte followed by the
//! payload. Variable-length fields are u32 big-endian length-prefixed byte
//! sequences; header sets are a u16 count followed by name/value pairs.
//! Header values are raw bytes — UTF-8 is not assumed. Bodies are capped by
//! the decoder's `max_body` so a misbehaving peer cannot balloon memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Default body cap: 10 MiB.
pub const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

/// Hard cap on headers per frame.
pub const MAX_HEADERS: usize = 256;

mod frame_type {
    pub const REGISTER: u8 = 0x01;
    pub const REGISTER_OK: u8 = 0x02;
    pub const REGISTER_REJECT: u8 = 0x03;
    pub const HTTP_REQ: u8 = 0x10;
    pub const HTTP_RESP: u8 = 0x11;
    pub const ERR: u8 = 0x12;
    pub const PING: u8 = 0x20;
    pub const PONG: u8 = 0x21;
    pub const SHUTDOWN: u8 = 0x30;
}

/// A header set as carried on the wire: raw name/value byte pairs.
pub type HeaderSet = Vec<(Bytes, Bytes)>;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client's opening message: the subdomains it wants to claim.
    Register { subdomains: Vec<String> },

    /// Per-subdomain acceptance with the composed public URL.
    RegisterOk {
        subdomain: String,
        public_url: String,
    },

    /// Per-subdomain rejection with a taxonomy reason string.
    RegisterReject { subdomain: String, reason: String },

    /// Server-to-client forwarded request.
    HttpRequest {
        id: u64,
        method: String,
        path_and_query: String,
        headers: HeaderSet,
        body: Bytes,
    },

    /// Client-to-server response; exactly one per request id.
    HttpResponse {
        id: u64,
        status: u16,
        headers: HeaderSet,
        body: Bytes,
    },

    /// Client-side failure for one request id; equivalent to a 502.
    Error { id: u64, kind: String },

    /// Liveness probe.
    Ping,

    /// Liveness reply.
    Pong,

    /// Server is draining; the client should reconnect elsewhere.
    Shutdown,
}

impl Frame {
    /// Encode into a single transport message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_hint());
        match self {
            Self::Register { subdomains } => {
                buf.put_u8(frame_type::REGISTER);
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16(subdomains.len().min(u16::MAX as usize) as u16);
                for s in subdomains {
                    put_bytes(&mut buf, s.as_bytes());
                }
            }
            Self::RegisterOk {
                subdomain,
                public_url,
            } => {
                buf.put_u8(frame_type::REGISTER_OK);
                put_bytes(&mut buf, subdomain.as_bytes());
                put_bytes(&mut buf, public_url.as_bytes());
            }
            Self::RegisterReject { subdomain, reason } => {
                buf.put_u8(frame_type::REGISTER_REJECT);
                put_bytes(&mut buf, subdomain.as_bytes());
                put_bytes(&mut buf, reason.as_bytes());
            }
            Self::HttpRequest {
                id,
                method,
                path_and_query,
                headers,
                body,
            } => {
                buf.put_u8(frame_type::HTTP_REQ);
                buf.put_u64(*id);
                put_bytes(&mut buf, method.as_bytes());
                put_bytes(&mut buf, path_and_query.as_bytes());
                put_headers(&mut buf, headers);
                put_bytes(&mut buf, body);
            }
            Self::HttpResponse {
                id,
                status,
                headers,
                body,
            } => {
                buf.put_u8(frame_type::HTTP_RESP);
                buf.put_u64(*id);
                buf.put_u16(*status);
                put_headers(&mut buf, headers);
                put_bytes(&mut buf, body);
            }
            Self::Error { id, kind } => {
                buf.put_u8(frame_type::ERR);
                buf.put_u64(*id);
                put_bytes(&mut buf, kind.as_bytes());
            }
            Self::Ping => buf.put_u8(frame_type::PING),
            Self::Pong => buf.put_u8(frame_type::PONG),
            Self::Shutdown => buf.put_u8(frame_type::SHUTDOWN),
        }
        buf.freeze()
    }

    /// Decode one transport message, enforcing the body cap.
    pub fn decode(mut data: Bytes, max_body: usize) -> Result<Self, ProtocolError> {
        if data.remaining() < 1 {
            return Err(ProtocolError::Truncated);
        }
        let kind = data.get_u8();
        match kind {
            frame_type::REGISTER => {
                let count = get_u16(&mut data)? as usize;
                if count > MAX_HEADERS {
                    return Err(ProtocolError::Malformed(format!(
                        "register carries {count} subdomains"
                    )));
                }
                let mut subdomains = Vec::with_capacity(count);
                for _ in 0..count {
                    subdomains.push(get_string(&mut data)?);
                }
                Ok(Self::Register { subdomains })
            }
            frame_type::REGISTER_OK => Ok(Self::RegisterOk {
                subdomain: get_string(&mut data)?,
                public_url: get_string(&mut data)?,
            }),
            frame_type::REGISTER_REJECT => Ok(Self::RegisterReject {
                subdomain: get_string(&mut data)?,
                reason: get_string(&mut data)?,
            }),
            frame_type::HTTP_REQ => {
                let id = get_u64(&mut data)?;
                let method = get_string(&mut data)?;
                let path_and_query = get_string(&mut data)?;
                let headers = get_headers(&mut data)?;
                let body = get_body(&mut data, max_body)?;
                Ok(Self::HttpRequest {
                    id,
                    method,
                    path_and_query,
                    headers,
                    body,
                })
            }
            frame_type::HTTP_RESP => {
                let id = get_u64(&mut data)?;
                let status = get_u16(&mut data)?;
                let headers = get_headers(&mut data)?;
                let body = get_body(&mut data, max_body)?;
                Ok(Self::HttpResponse {
                    id,
                    status,
                    headers,
                    body,
                })
            }
            frame_type::ERR => Ok(Self::Error {
                id: get_u64(&mut data)?,
                kind: get_string(&mut data)?,
            }),
            frame_type::PING => Ok(Self::Ping),
            frame_type::PONG => Ok(Self::Pong),
            frame_type::SHUTDOWN => Ok(Self::Shutdown),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    /// Rough pre-allocation size for `encode`.
    fn encoded_hint(&self) -> usize {
        match self {
            Self::HttpRequest { headers, body, .. } | Self::HttpResponse { headers, body, .. } => {
                64 + headers.len() * 48 + body.len()
            }
            _ => 64,
        }
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderSet) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(headers.len().min(MAX_HEADERS) as u16);
    for (name, value) in headers.iter().take(MAX_HEADERS) {
        put_bytes(buf, name);
        put_bytes(buf, value);
    }
}

fn get_u16(data: &mut Bytes) -> Result<u16, ProtocolError> {
    if data.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    Ok(data.get_u16())
}

fn get_u64(data: &mut Bytes) -> Result<u64, ProtocolError> {
    if data.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    Ok(data.get_u64())
}

fn get_bytes(data: &mut Bytes) -> Result<Bytes, ProtocolError> {
    if data.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    Ok(data.split_to(len))
}

fn get_string(data: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_bytes(data)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::Malformed("expected UTF-8 field".to_owned()))
}

fn get_headers(data: &mut Bytes) -> Result<HeaderSet, ProtocolError> {
    let count = get_u16(data)? as usize;
    if count > MAX_HEADERS {
        return Err(ProtocolError::TooManyHeaders(count));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_bytes(data)?;
        let value = get_bytes(data)?;
        headers.push((name, value));
    }
    Ok(headers)
}

fn get_body(data: &mut Bytes, max_body: usize) -> Result<Bytes, ProtocolError> {
    if data.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let len = data.get_u32() as usize;
    if len > max_body {
        return Err(ProtocolError::BodyTooLarge { len, max: max_body });
    }
    if data.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    Ok(data.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        Frame::decode(frame.encode(), DEFAULT_MAX_BODY).unwrap()
    }

    #[test]
    fn register_round_trips() {
        let frame = Frame::Register {
            subdomains: vec!["web".to_owned(), "docs".to_owned()],
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn http_request_preserves_non_utf8_header_values() {
        let frame = Frame::HttpRequest {
            id: 42,
            method: "POST".to_owned(),
            path_and_query: "/submit?x=1".to_owned(),
            headers: vec![(
                Bytes::from_static(b"x-binary"),
                Bytes::from_static(&[0xff, 0xfe, 0x00]),
            )],
            body: Bytes::from_static(b"payload"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn body_over_cap_is_rejected() {
        let frame = Frame::HttpResponse {
            id: 1,
            status: 200,
            headers: Vec::new(),
            body: Bytes::from(vec![0u8; 1024]),
        };
        let err = Frame::decode(frame.encode(), 512).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BodyTooLarge {
                len: 1024,
                max: 512
            }
        );
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let encoded = Frame::RegisterOk {
            subdomain: "web".to_owned(),
            public_url: "https://web.tun.example".to_owned(),
        }
        .encode();
        let cut = encoded.slice(0..encoded.len() - 3);
        assert_eq!(
            Frame::decode(cut, DEFAULT_MAX_BODY).unwrap_err(),
            ProtocolError::Truncated
        );
    }

    #[test]
    fn unknown_type_byte_is_an_error() {
        let data = Bytes::from_static(&[0x7f]);
        assert_eq!(
            Frame::decode(data, DEFAULT_MAX_BODY).unwrap_err(),
            ProtocolError::UnknownType(0x7f)
        );
    }

    #[test]
    fn control_frames_are_one_byte() {
        assert_eq!(Frame::Ping.encode().len(), 1);
        assert_eq!(round_trip(Frame::Pong), Frame::Pong);
        assert_eq!(round_trip(Frame::Shutdown), Frame::Shutdown);
    }
}
