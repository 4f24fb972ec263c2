use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
///
/// Any decode error on a live connection closes it with reason
/// `protocol_error`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame ended before its declared contents.
    #[error("frame truncated")]
    Truncated,

    /// Unknown message-type byte.
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// A body exceeded the configured maximum.
    #[error("body of {len} bytes exceeds the {max}-byte limit")]
    BodyTooLarge { len: usize, max: usize },

    /// Header count above the hard cap.
    #[error("frame carries {0} headers, above the cap")]
    TooManyHeaders(usize),

    /// A field that must be UTF-8 was not.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Why a forward attempt did not produce a response.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No live tunnel owns the subdomain.
    #[error("no tunnel attached")]
    NoTunnel,

    /// The client did not answer within the forward timeout.
    #[error("tunnel response timed out")]
    Timeout,

    /// The tunnel closed while the request was pending.
    #[error("tunnel closed")]
    Closed,

    /// The client reported an upstream error for this request.
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Errors from the transport layer beneath the framing.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// An I/O or transport-protocol failure.
    #[error("transport error: {0}")]
    Io(String),
}
