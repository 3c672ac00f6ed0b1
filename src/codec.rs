// ABOUTME: MessagePack-RPC v0 wire codec — streaming frame decoder and packer
// ABOUTME: Owns only the array-shaped request/response framing, not the MessagePack binary format itself

use bytes::{Buf, BytesMut};
use rmpv::Value;
use std::collections::HashSet;
use std::io::{self, Cursor};
use thiserror::Error;

/// MessagePack-RPC request type tag (§3).
pub const REQUEST_TYPE: i64 = 0;
/// MessagePack-RPC response type tag (§3).
pub const RESPONSE_TYPE: i64 = 1;

/// Number of bytes read per socket poll while filling the decode buffer.
pub const SOCKET_RECV_SIZE: usize = 1024;

/// Codec-level errors.
///
/// An incomplete frame (not enough bytes buffered yet) isn't one of
/// these: `Decoder::next` reports that as `Ok(None)`, not an `Err`, so
/// callers never need to treat "keep reading" as a hard failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed MessagePack data: {0}")]
    Malformed(String),

    #[error("expected a 4-element array, got {0}")]
    WrongShape(String),

    #[error("expected type tag {expected}, got {actual}")]
    WrongType { expected: i64, actual: String },

    #[error("duplicate key in map: {0:?}")]
    DuplicateMapKey(Value),
}

/// Opaque passthrough for packer/unpacker options.
///
/// `strict_map_key` rejects frames whose params/result contain a map
/// with duplicate keys. Additional knobs are intentionally not
/// enumerated here: the spec treats packer/unpacker configuration as an
/// external-library concern and this struct exists only to thread
/// whatever options a given codec needs through `Server`/`Client`
/// construction without a global.
#[derive(Debug, Clone, Default)]
pub struct CodecOptions {
    pub strict_map_key: bool,
}

/// A decoded request, already shape-validated.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub msg_id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// A decoded response, already shape-validated.
///
/// `msg_id` is signed because the server uses the sentinel `-1` for
/// protocol-level errors that occur before a request could be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub msg_id: i64,
    pub error: Option<Value>,
    pub result: Option<Value>,
}

impl ResponseFrame {
    /// Build the `(1, msg_id, error, result)` value for a successful call.
    pub fn ok(msg_id: i64, result: Value) -> Self {
        ResponseFrame {
            msg_id,
            error: None,
            result: Some(result),
        }
    }

    /// Build the `(1, msg_id, error, null)` value for a failed call, with
    /// a single-string legacy error field.
    pub fn error(msg_id: i64, message: impl Into<String>) -> Self {
        ResponseFrame {
            msg_id,
            error: Some(Value::String(message.into().into())),
            result: None,
        }
    }

    /// Build the `(1, msg_id, (kind, message), null)` enhanced error form.
    pub fn enhanced_error(msg_id: i64, kind: impl Into<String>, message: impl Into<String>) -> Self {
        ResponseFrame {
            msg_id,
            error: Some(Value::Array(vec![
                Value::String(kind.into().into()),
                Value::String(message.into().into()),
            ])),
            result: None,
        }
    }
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Nil => "nil".into(),
        Value::Boolean(_) => "boolean".into(),
        Value::Integer(_) => "integer".into(),
        Value::F32(_) | Value::F64(_) => "float".into(),
        Value::String(_) => "string".into(),
        Value::Binary(_) => "binary".into(),
        Value::Array(_) => "array".into(),
        Value::Map(_) => "map".into(),
        Value::Ext(..) => "ext".into(),
    }
}

fn check_no_duplicate_keys(value: &Value, options: &CodecOptions) -> Result<(), CodecError> {
    if !options.strict_map_key {
        return Ok(());
    }
    match value {
        Value::Map(entries) => {
            let mut seen = HashSet::new();
            for (key, val) in entries {
                if !seen.insert(format!("{key:?}")) {
                    return Err(CodecError::DuplicateMapKey(key.clone()));
                }
                check_no_duplicate_keys(val, options)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_no_duplicate_keys(item, options)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Interpret a decoded top-level value as a request frame.
///
/// This is the VALIDATE step from §4.4: any shape other than a 4-element
/// array tagged `REQUEST_TYPE` is a protocol error, not a panic.
pub fn decode_request(value: &Value, options: &CodecOptions) -> Result<RequestFrame, CodecError> {
    check_no_duplicate_keys(value, options)?;

    let items = value
        .as_array()
        .ok_or_else(|| CodecError::WrongShape(type_name(value)))?;
    if items.len() != 4 {
        return Err(CodecError::WrongShape(format!("array of {}", items.len())));
    }

    let tag = items[0]
        .as_i64()
        .ok_or_else(|| CodecError::WrongType {
            expected: REQUEST_TYPE,
            actual: type_name(&items[0]),
        })?;
    if tag != REQUEST_TYPE {
        return Err(CodecError::WrongType {
            expected: REQUEST_TYPE,
            actual: tag.to_string(),
        });
    }

    let msg_id = items[1]
        .as_u64()
        .ok_or_else(|| CodecError::WrongShape("msg_id not an unsigned integer".into()))?;

    let method = items[2]
        .as_str()
        .ok_or_else(|| CodecError::WrongShape("method name not a string".into()))?
        .to_string();

    let params = items[3]
        .as_array()
        .ok_or_else(|| CodecError::WrongShape("params not an array".into()))?
        .to_vec();

    Ok(RequestFrame {
        msg_id,
        method,
        params,
    })
}

/// Interpret a decoded top-level value as a response frame.
pub fn decode_response(value: &Value, options: &CodecOptions) -> Result<ResponseFrame, CodecError> {
    check_no_duplicate_keys(value, options)?;

    let items = value
        .as_array()
        .ok_or_else(|| CodecError::WrongShape(type_name(value)))?;
    if items.len() != 4 {
        return Err(CodecError::WrongShape(format!("array of {}", items.len())));
    }

    let tag = items[0]
        .as_i64()
        .ok_or_else(|| CodecError::WrongType {
            expected: RESPONSE_TYPE,
            actual: type_name(&items[0]),
        })?;
    if tag != RESPONSE_TYPE {
        return Err(CodecError::WrongType {
            expected: RESPONSE_TYPE,
            actual: tag.to_string(),
        });
    }

    let msg_id = items[1]
        .as_i64()
        .ok_or_else(|| CodecError::WrongShape("msg_id not an integer".into()))?;

    let error = match &items[2] {
        Value::Nil => None,
        other => Some(other.clone()),
    };
    let result = match &items[3] {
        Value::Nil => None,
        other => Some(other.clone()),
    };

    Ok(ResponseFrame {
        msg_id,
        error,
        result,
    })
}

/// Encode a request as the wire tuple `(0, msg_id, method, params)`.
pub fn pack_request(msg_id: u64, method: &str, params: &[Value]) -> bytes::Bytes {
    let value = Value::Array(vec![
        Value::Integer(REQUEST_TYPE.into()),
        Value::Integer(msg_id.into()),
        Value::String(method.into()),
        Value::Array(params.to_vec()),
    ]);
    encode(&value)
}

/// Encode a response as the wire tuple `(1, msg_id, error, result)`.
pub fn pack_response(frame: &ResponseFrame) -> bytes::Bytes {
    let value = Value::Array(vec![
        Value::Integer(RESPONSE_TYPE.into()),
        Value::Integer(frame.msg_id.into()),
        frame.error.clone().unwrap_or(Value::Nil),
        frame.result.clone().unwrap_or(Value::Nil),
    ]);
    encode(&value)
}

pub(crate) fn encode(value: &Value) -> bytes::Bytes {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).expect("encoding a Value never fails");
    bytes::Bytes::from(buf)
}

/// Stateful, framing-agnostic streaming decoder.
///
/// A single `feed` may be followed by zero, one, or many `next` calls:
/// one TCP read can contain a partial frame, exactly one frame, or
/// several frames back to back. Callers must drain `next` to `None`
/// before reading more bytes from the socket.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buffer: BytesMut::new(),
        }
    }

    /// Append newly-read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempt to decode one complete top-level MessagePack value.
    ///
    /// Returns `Ok(None)` when the buffer doesn't yet hold a complete
    /// value (the Rust analogue of the Python unpacker's "no items
    /// yet"), leaving the buffer untouched so the next `feed` can be
    /// appended and retried from scratch.
    pub fn next(&mut self) -> Result<Option<Value>, CodecError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buffer[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Err(rmpv::decode::Error::InvalidMarkerRead(e))
            | Err(rmpv::decode::Error::InvalidDataRead(e))
                if e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            }
            Err(e) => Err(CodecError::Malformed(e.to_string())),
        }
    }
}
