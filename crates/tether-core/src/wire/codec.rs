//! Binary encoding of frames and length-prefixed stream framing.
//!
//! Every frame is a 4-byte big-endian length followed by the body:
//!
//! ```text
//! [u32 BE: len][u8 tag][u64 BE: transaction id][tag-specific fields...]
//! ```
//!
//! Request fields: service and method names (u32 length + UTF-8), serializer
//! id (u32), argument count (u32), then the serialized arguments up to the end
//! of the body.
//!
//! Response fields: responded-at millis (u64), exception flag (u8) with the
//! message when set, return-value flag (u8) with serializer id (u32) and the
//! serialized value up to the end of the body when set.

use super::frame::{Frame, RequestFrame, ResponseBody, ResponseFrame, REQUEST_TAG, RESPONSE_TAG};
use crate::error::{Result, TetherError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix in front of every frame body.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Body size of an encoded frame, the quantity bounded by the frame limit.
pub fn body_len(encoded: &[u8]) -> usize {
    encoded.len().saturating_sub(LENGTH_PREFIX_SIZE)
}

/// Encode a frame, including its length prefix.
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_size_hint(frame));
    buf.put_u32(0);

    match frame {
        Frame::Request(req) => {
            buf.put_u8(REQUEST_TAG);
            buf.put_u64(req.transaction_id);
            put_string(&mut buf, &req.service_name)?;
            put_string(&mut buf, &req.method_name)?;
            buf.put_u32(req.serializer_id);
            buf.put_u32(req.argument_count);
            buf.put_slice(&req.arguments);
        }
        Frame::Response(resp) => {
            buf.put_u8(RESPONSE_TAG);
            buf.put_u64(resp.transaction_id);
            buf.put_u64(resp.server_responded_at_millis);
            match &resp.body {
                ResponseBody::Empty => {
                    buf.put_u8(0);
                    buf.put_u8(0);
                }
                ResponseBody::Exception(message) => {
                    buf.put_u8(1);
                    put_string(&mut buf, message)?;
                    buf.put_u8(0);
                }
                ResponseBody::Value {
                    serializer_id,
                    payload,
                } => {
                    buf.put_u8(0);
                    buf.put_u8(1);
                    buf.put_u32(*serializer_id);
                    buf.put_slice(payload);
                }
            }
        }
    }

    let size = body_len(&buf);
    let prefix = u32::try_from(size).map_err(|_| {
        TetherError::protocol(format!("frame body of {} bytes exceeds u32 length prefix", size))
    })?;
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&prefix.to_be_bytes());

    Ok(buf.freeze())
}

/// Decode exactly one frame, including its length prefix.
pub fn decode(mut bytes: Bytes) -> Result<Frame> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(TetherError::protocol(format!(
            "truncated length prefix: {} of {} bytes",
            bytes.len(),
            LENGTH_PREFIX_SIZE
        )));
    }

    let declared = bytes.get_u32() as usize;
    if bytes.len() < declared {
        return Err(TetherError::protocol(format!(
            "truncated frame: declared {} bytes, got {}",
            declared,
            bytes.len()
        )));
    }
    if bytes.len() > declared {
        return Err(TetherError::protocol(format!(
            "{} trailing bytes after frame",
            bytes.len() - declared
        )));
    }

    decode_body(bytes)
}

/// Decode a frame body that was read without its length prefix.
pub fn decode_body(body: Bytes) -> Result<Frame> {
    let mut reader = BodyReader { body };

    match reader.u8("message type")? {
        REQUEST_TAG => {
            let transaction_id = reader.u64("transaction id")?;
            let service_name = reader.string("service name")?;
            let method_name = reader.string("method name")?;
            let serializer_id = reader.u32("serializer id")?;
            let argument_count = reader.u32("argument count")?;
            let arguments = reader.rest();

            Ok(Frame::Request(RequestFrame {
                transaction_id,
                service_name,
                method_name,
                serializer_id,
                argument_count,
                arguments,
            }))
        }
        RESPONSE_TAG => {
            let transaction_id = reader.u64("transaction id")?;
            let server_responded_at_millis = reader.u64("responded-at timestamp")?;

            let exception = if reader.flag("exception flag")? {
                Some(reader.string("exception message")?)
            } else {
                None
            };
            let has_return_value = reader.flag("return-value flag")?;

            let body = match (exception, has_return_value) {
                (Some(_), true) => {
                    return Err(TetherError::protocol(
                        "response carries both an exception and a return value",
                    ));
                }
                (Some(message), false) => {
                    reader.expect_end()?;
                    ResponseBody::Exception(message)
                }
                (None, true) => {
                    let serializer_id = reader.u32("return-value serializer id")?;
                    ResponseBody::Value {
                        serializer_id,
                        payload: reader.rest(),
                    }
                }
                (None, false) => {
                    reader.expect_end()?;
                    ResponseBody::Empty
                }
            };

            Ok(Frame::Response(ResponseFrame {
                transaction_id,
                server_responded_at_millis,
                body,
            }))
        }
        other => Err(TetherError::protocol(format!(
            "unknown message type tag {}",
            other
        ))),
    }
}

/// Read one length-prefixed frame body from an async reader.
///
/// Returns `None` on clean EOF at a frame boundary. EOF inside a frame and
/// bodies larger than `max_frame_size` are protocol errors.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TetherError::protocol(
                "connection closed inside a frame length prefix",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(TetherError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len, max_frame_size
        )));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(Bytes::from(body))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TetherError::protocol(
            format!("connection closed inside a {} byte frame", len),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Write an encoded frame (prefix included) and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        TetherError::protocol(format!("string of {} bytes exceeds u32 length", value.len()))
    })?;
    buf.put_u32(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn body_size_hint(frame: &Frame) -> usize {
    match frame {
        Frame::Request(req) => {
            1 + 8 + 4 + req.service_name.len() + 4 + req.method_name.len() + 4 + 4
                + req.arguments.len()
        }
        Frame::Response(resp) => {
            1 + 8 + 8 + 2
                + match &resp.body {
                    ResponseBody::Empty => 0,
                    ResponseBody::Exception(message) => 4 + message.len(),
                    ResponseBody::Value { payload, .. } => 4 + payload.len(),
                }
        }
    }
}

/// Bounds-checked cursor over a frame body.
struct BodyReader {
    body: Bytes,
}

impl BodyReader {
    fn need(&self, n: usize, field: &str) -> Result<()> {
        if self.body.remaining() < n {
            return Err(TetherError::protocol(format!(
                "truncated frame while reading {}: need {} bytes, {} left",
                field,
                n,
                self.body.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        self.need(1, field)?;
        Ok(self.body.get_u8())
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        self.need(4, field)?;
        Ok(self.body.get_u32())
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        self.need(8, field)?;
        Ok(self.body.get_u64())
    }

    fn flag(&mut self, field: &str) -> Result<bool> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TetherError::protocol(format!(
                "invalid {} byte {}",
                field, other
            ))),
        }
    }

    fn string(&mut self, field: &str) -> Result<String> {
        let len = self.u32(field)? as usize;
        self.need(len, field)?;
        let raw = self.body.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| TetherError::protocol(format!("{} is not valid UTF-8", field)))
    }

    fn rest(&mut self) -> Bytes {
        let len = self.body.remaining();
        self.body.split_to(len)
    }

    fn expect_end(&self) -> Result<()> {
        if self.body.has_remaining() {
            return Err(TetherError::protocol(format!(
                "{} unexpected bytes at end of response",
                self.body.remaining()
            )));
        }
        Ok(())
    }
}
