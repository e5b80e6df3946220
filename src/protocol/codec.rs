//! Wire codec.
//!
//! Every field on the wire is a type-tagged primitive ([`WireValue`]). A
//! request is a fixed header of four values followed by its parameters;
//! server frames start with a kind tag so responses and out-of-band
//! invalidations can share the stream.
//!
//! Decoding works on a borrowed view of the read buffer and consumes bytes
//! only once a whole value or frame is available, so a decode abandoned for
//! lack of data leaves the buffer untouched.

use crate::core::error::{HostplaneError, HostplaneResult, WireStatus};
use crate::session::InvalidateBatch;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_LONG: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_INT_LIST: u8 = 0x06;

/// Server frame kind: response to a request.
pub const FRAME_RESPONSE: i32 = 1;
/// Server frame kind: out-of-band invalidation.
pub const FRAME_INVALIDATE: i32 = 2;

/// Request header fields before the parameters.
const REQUEST_HEADER_VALUES: usize = 4;

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded.
    Complete(T),
    /// More data is needed to complete the frame.
    Incomplete,
    /// The input is invalid.
    Invalid(String),
}

/// One tagged primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
    Null,
    IntList(Vec<i32>),
}

impl WireValue {
    /// Append the encoded value to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Bool(value) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*value));
            }
            Self::Int(value) => {
                buf.put_u8(TAG_INT);
                buf.put_i32(*value);
            }
            Self::Long(value) => {
                buf.put_u8(TAG_LONG);
                buf.put_i64(*value);
            }
            Self::Str(value) => {
                buf.put_u8(TAG_STR);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value.as_bytes());
            }
            Self::Null => buf.put_u8(TAG_NULL),
            Self::IntList(values) => {
                buf.put_u8(TAG_INT_LIST);
                buf.put_u32(values.len() as u32);
                for value in values {
                    buf.put_i32(*value);
                }
            }
        }
    }

    /// Parse one value from the front of `data`.
    ///
    /// On success returns the value and the number of bytes it occupied.
    /// Strings and lists longer than `max_len` bytes are rejected.
    pub fn parse(data: &[u8], max_len: usize) -> DecodeResult<(WireValue, usize)> {
        let mut cursor = data;
        if cursor.is_empty() {
            return DecodeResult::Incomplete;
        }
        let tag = cursor.get_u8();
        let value = match tag {
            TAG_BOOL => {
                if cursor.remaining() < 1 {
                    return DecodeResult::Incomplete;
                }
                match cursor.get_u8() {
                    0 => WireValue::Bool(false),
                    1 => WireValue::Bool(true),
                    other => return DecodeResult::Invalid(format!("invalid bool byte {}", other)),
                }
            }
            TAG_INT => {
                if cursor.remaining() < 4 {
                    return DecodeResult::Incomplete;
                }
                WireValue::Int(cursor.get_i32())
            }
            TAG_LONG => {
                if cursor.remaining() < 8 {
                    return DecodeResult::Incomplete;
                }
                WireValue::Long(cursor.get_i64())
            }
            TAG_STR => {
                if cursor.remaining() < 4 {
                    return DecodeResult::Incomplete;
                }
                let len = cursor.get_u32() as usize;
                if len > max_len {
                    return DecodeResult::Invalid(format!(
                        "string of {} bytes exceeds limit {}",
                        len, max_len
                    ));
                }
                if cursor.remaining() < len {
                    return DecodeResult::Incomplete;
                }
                match std::str::from_utf8(&cursor[..len]) {
                    Ok(text) => {
                        let text = text.to_string();
                        cursor.advance(len);
                        WireValue::Str(text)
                    }
                    Err(_) => return DecodeResult::Invalid("string is not utf-8".to_string()),
                }
            }
            TAG_NULL => WireValue::Null,
            TAG_INT_LIST => {
                if cursor.remaining() < 4 {
                    return DecodeResult::Incomplete;
                }
                let count = cursor.get_u32() as usize;
                if count.saturating_mul(4) > max_len {
                    return DecodeResult::Invalid(format!(
                        "list of {} ints exceeds limit {}",
                        count, max_len
                    ));
                }
                if cursor.remaining() < count * 4 {
                    return DecodeResult::Incomplete;
                }
                WireValue::IntList((0..count).map(|_| cursor.get_i32()).collect())
            }
            other => return DecodeResult::Invalid(format!("unknown value tag {:#04x}", other)),
        };
        DecodeResult::Complete((value, data.len() - cursor.len()))
    }

    /// Decode one value, consuming it from `buf` only when complete.
    pub fn decode(buf: &mut BytesMut, max_len: usize) -> DecodeResult<WireValue> {
        match Self::parse(buf, max_len) {
            DecodeResult::Complete((value, used)) => {
                buf.advance(used);
                DecodeResult::Complete(value)
            }
            DecodeResult::Incomplete => DecodeResult::Incomplete,
            DecodeResult::Invalid(reason) => DecodeResult::Invalid(reason),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Str(_) => "string",
            Self::Null => "null",
            Self::IntList(_) => "int list",
        }
    }

    fn mismatch(&self, expected: &str) -> HostplaneError {
        HostplaneError::protocol(format!("expected {}, got {}", expected, self.type_name()))
    }

    pub fn as_bool(&self) -> HostplaneResult<bool> {
        match self {
            Self::Bool(value) => Ok(*value),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_int(&self) -> HostplaneResult<i32> {
        match self {
            Self::Int(value) => Ok(*value),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_long(&self) -> HostplaneResult<i64> {
        match self {
            Self::Long(value) => Ok(*value),
            other => Err(other.mismatch("long")),
        }
    }

    pub fn as_str(&self) -> HostplaneResult<&str> {
        match self {
            Self::Str(value) => Ok(value),
            other => Err(other.mismatch("string")),
        }
    }

    /// String or null.
    pub fn as_opt_str(&self) -> HostplaneResult<Option<&str>> {
        match self {
            Self::Str(value) => Ok(Some(value)),
            Self::Null => Ok(None),
            other => Err(other.mismatch("string or null")),
        }
    }

    /// Int or null.
    pub fn as_opt_int(&self) -> HostplaneResult<Option<i32>> {
        match self {
            Self::Int(value) => Ok(Some(*value)),
            Self::Null => Ok(None),
            other => Err(other.mismatch("int or null")),
        }
    }
}

/// Parse `count` consecutive values from the front of `data`.
fn parse_values(
    data: &[u8],
    mut offset: usize,
    count: usize,
    max_len: usize,
) -> DecodeResult<(Vec<WireValue>, usize)> {
    let mut values = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        match WireValue::parse(&data[offset..], max_len) {
            DecodeResult::Complete((value, used)) => {
                values.push(value);
                offset += used;
            }
            DecodeResult::Incomplete => return DecodeResult::Incomplete,
            DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
        }
    }
    DecodeResult::Complete((values, offset))
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Sequence number; must follow the previous request's.
    pub sequence: i64,
    /// Version-local table ordinal, or -1 when the opcode names no table.
    pub table: i32,
    pub opcode: i32,
    pub params: Vec<WireValue>,
}

/// Frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Response {
        sequence: i64,
        status: WireStatus,
        payload: Vec<WireValue>,
    },
    Invalidate(InvalidateBatch),
}

/// Trait for protocol codecs.
///
/// The server and a client speak the same primitives with the frame
/// directions swapped.
pub trait ProtocolCodec: Send + Sync {
    /// The frame type decoded from the wire.
    type Inbound;

    /// The frame type encoded to the wire.
    type Outbound;

    /// Attempt to decode a frame, consuming its bytes only on `Complete`.
    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<Self::Inbound>;

    /// Encode a frame to bytes.
    fn encode(&self, frame: &Self::Outbound) -> Bytes;
}

/// Server side: decodes requests, encodes server frames.
#[derive(Debug, Clone, Copy)]
pub struct ServerCodec {
    max_frame_bytes: usize,
}

impl ServerCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl ProtocolCodec for ServerCodec {
    type Inbound = Request;
    type Outbound = ServerFrame;

    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<Request> {
        let (header, offset) =
            match parse_values(buffer, 0, REQUEST_HEADER_VALUES, self.max_frame_bytes) {
                DecodeResult::Complete(parsed) => parsed,
                DecodeResult::Incomplete => return self.incomplete(buffer),
                DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
            };

        let header = match decode_request_header(&header) {
            Ok(header) => header,
            Err(err) => return DecodeResult::Invalid(err.to_string()),
        };
        let (sequence, table, opcode, param_count) = header;

        let (params, used) = match parse_values(buffer, offset, param_count, self.max_frame_bytes)
        {
            DecodeResult::Complete(parsed) => parsed,
            DecodeResult::Incomplete => return self.incomplete(buffer),
            DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
        };
        buffer.advance(used);
        DecodeResult::Complete(Request {
            sequence,
            table,
            opcode,
            params,
        })
    }

    fn encode(&self, frame: &ServerFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match frame {
            ServerFrame::Response {
                sequence,
                status,
                payload,
            } => {
                WireValue::Int(FRAME_RESPONSE).encode(&mut buf);
                WireValue::Long(*sequence).encode(&mut buf);
                WireValue::Int(status.code()).encode(&mut buf);
                WireValue::Int(payload.len() as i32).encode(&mut buf);
                for value in payload {
                    value.encode(&mut buf);
                }
            }
            ServerFrame::Invalidate(batch) => {
                WireValue::Int(FRAME_INVALIDATE).encode(&mut buf);
                WireValue::IntList(batch.tables.clone()).encode(&mut buf);
                match batch.sync_id {
                    Some(id) => WireValue::Long(id).encode(&mut buf),
                    None => WireValue::Null.encode(&mut buf),
                }
            }
        }
        buf.freeze()
    }
}

impl ServerCodec {
    fn incomplete<T>(&self, buffer: &BytesMut) -> DecodeResult<T> {
        if buffer.len() > self.max_frame_bytes {
            DecodeResult::Invalid(format!(
                "request exceeds {} bytes",
                self.max_frame_bytes
            ))
        } else {
            DecodeResult::Incomplete
        }
    }
}

fn decode_request_header(values: &[WireValue]) -> HostplaneResult<(i64, i32, i32, usize)> {
    let [sequence, table, opcode, count] = values else {
        return Err(HostplaneError::protocol("truncated request header"));
    };
    let count = count.as_int()?;
    let count = usize::try_from(count)
        .map_err(|_| HostplaneError::protocol(format!("negative parameter count {}", count)))?;
    Ok((sequence.as_long()?, table.as_int()?, opcode.as_int()?, count))
}

/// Client side: decodes server frames, encodes requests.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    max_frame_bytes: usize,
}

impl ClientCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl ProtocolCodec for ClientCodec {
    type Inbound = ServerFrame;
    type Outbound = Request;

    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<ServerFrame> {
        let (kind, offset) = match WireValue::parse(buffer, self.max_frame_bytes) {
            DecodeResult::Complete(parsed) => parsed,
            DecodeResult::Incomplete => return DecodeResult::Incomplete,
            DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
        };
        let expected = match kind {
            WireValue::Int(FRAME_RESPONSE) => 3,
            WireValue::Int(FRAME_INVALIDATE) => 2,
            other => return DecodeResult::Invalid(format!("unknown frame kind {:?}", other)),
        };
        let (fields, mut offset) = match parse_values(buffer, offset, expected, self.max_frame_bytes)
        {
            DecodeResult::Complete(parsed) => parsed,
            DecodeResult::Incomplete => return DecodeResult::Incomplete,
            DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
        };

        let frame = match (kind, fields.as_slice()) {
            (WireValue::Int(FRAME_RESPONSE), [sequence, status, count]) => {
                let header = sequence.as_long().and_then(|sequence| {
                    let status = status.as_int()?;
                    let status = WireStatus::from_code(status).ok_or_else(|| {
                        HostplaneError::protocol(format!("unknown status {}", status))
                    })?;
                    let count = usize::try_from(count.as_int()?)
                        .map_err(|_| HostplaneError::protocol("negative payload count"))?;
                    Ok((sequence, status, count))
                });
                let (sequence, status, count) = match header {
                    Ok(header) => header,
                    Err(err) => return DecodeResult::Invalid(err.to_string()),
                };
                let (payload, used) =
                    match parse_values(buffer, offset, count, self.max_frame_bytes) {
                        DecodeResult::Complete(parsed) => parsed,
                        DecodeResult::Incomplete => return DecodeResult::Incomplete,
                        DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
                    };
                offset = used;
                ServerFrame::Response {
                    sequence,
                    status,
                    payload,
                }
            }
            (_, [WireValue::IntList(tables), sync]) => {
                let sync_id = match sync {
                    WireValue::Long(id) => Some(*id),
                    WireValue::Null => None,
                    other => {
                        return DecodeResult::Invalid(format!("invalid sync id {:?}", other))
                    }
                };
                ServerFrame::Invalidate(InvalidateBatch {
                    tables: tables.clone(),
                    sync_id,
                })
            }
            (_, fields) => {
                return DecodeResult::Invalid(format!("malformed server frame {:?}", fields))
            }
        };
        buffer.advance(offset);
        DecodeResult::Complete(frame)
    }

    fn encode(&self, request: &Request) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        WireValue::Long(request.sequence).encode(&mut buf);
        WireValue::Int(request.table).encode(&mut buf);
        WireValue::Int(request.opcode).encode(&mut buf);
        WireValue::Int(request.params.len() as i32).encode(&mut buf);
        for value in &request.params {
            value.encode(&mut buf);
        }
        buf.freeze()
    }
}
