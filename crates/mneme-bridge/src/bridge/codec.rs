//! Newline-delimited JSON framing.
//!
//! Every message is one compact JSON document followed by `\n`. Framing is by
//! delimiter only, so the decoder carries nothing between reads except the
//! bytes of an incomplete trailing line.
//!
//! Malformed lines are dropped (and logged) rather than returned as errors: a
//! single bad line from the worker must not stall the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::Request;
use crate::error::BridgeError;

/// Serialize a request to one newline-terminated line.
pub fn encode(request: &Request) -> Result<Bytes, BridgeError> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    tracing::trace!(
        request_id = %request.id,
        line_bytes = line.len(),
        "Encoded request"
    );
    Ok(Bytes::from(line))
}

/// Convert typed params to a JSON value.
///
/// NaN and infinities fail with `Encoding` instead of silently becoming `null`.
pub fn to_params<P: Serialize + ?Sized>(params: &P) -> Result<Value, BridgeError> {
    super::finite::ensure_finite(params)?;
    Ok(serde_json::to_value(params)?)
}

/// Append `incoming` to `buffer` and extract every complete line as a JSON object.
///
/// Whatever follows the last `\n` stays in `buffer` for the next call. Lines that
/// are blank, not valid JSON, or not a JSON object are skipped.
pub fn decode(buffer: &mut BytesMut, incoming: &[u8]) -> Vec<Value> {
    buffer.extend_from_slice(incoming);

    let mut messages = Vec::new();
    while let Some(line) = next_line(buffer) {
        match parse_line::<Value>(&line) {
            Some(value) if value.is_object() => messages.push(value),
            Some(_) => {
                tracing::warn!(line_bytes = line.len(), "Dropping non-object line from worker");
            }
            None => {}
        }
    }
    messages
}

/// Split the next complete line off the front of `buffer`, without its terminator.
///
/// A trailing `\r` is stripped as well. Returns `None` when no `\n` is buffered.
fn next_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let newline = buffer.iter().position(|b| *b == b'\n')?;
    let mut line = buffer.split_to(newline + 1);
    line.truncate(newline);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(line)
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(item) => Some(item),
        Err(e) => {
            let err = BridgeError::Decoding(e.to_string());
            tracing::warn!(line_bytes = line.len(), error = %err, "Dropping malformed line");
            None
        }
    }
}

/// `tokio_util` codec for newline-delimited JSON over any AsyncRead/AsyncWrite.
///
/// Used by the worker side of the protocol, where a typed `FramedRead` is more
/// convenient than feeding raw chunks.
pub struct JsonLineCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = next_line(src) {
            if let Some(item) = parse_line(&line) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        // Unterminated final line: try it once, then discard.
        let rest = src.split();
        Ok(parse_line(&rest))
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
