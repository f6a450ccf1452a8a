//! A resumable RESP (v2) pull-parser plus the `tokio_util` codec that
//! drives it for the multiplexed connection path.
//!
//! The parser keeps all positional state in [`ValueDecoder`] itself
//! (rather than on the call stack) so that a value spanning more than one
//! `read()` resumes without re-scanning bytes already consumed. This is
//! the same shape as redis-rs's own move away from a `combine`-based
//! parser towards a hand-rolled resumable one: fewer moving parts, same
//! "need more data" contract.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{ErrorKind, RedisError, RedisResult, Value};

/// How large a single buffered read chunk is, absent an override from the
/// connection URL's `reader_read_size` option.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// One step of RESP framing: either we need to read more bytes before we
/// can make progress, we started a new array frame (its children are
/// parsed by further steps, not recursion), or we produced a scalar value.
enum Step {
    NeedMore,
    Pushed,
    Done(Value),
}

/// A frame being assembled: an array collects its children here while
/// nested arrays recurse into their own frame below it on `pending`.
struct ArrayFrame {
    remaining: usize,
    items: Vec<Value>,
}

/// Resumable decoder state. `pending` is a stack of in-progress arrays;
/// an empty stack means we are awaiting a fresh top-level value.
#[derive(Default)]
pub struct ValueDecoder {
    pending: Vec<ArrayFrame>,
}

impl ValueDecoder {
    pub fn new() -> Self {
        ValueDecoder { pending: Vec::new() }
    }

    /// Attempts to decode one top-level value from `buf`, consuming only
    /// the bytes that belong to it. Returns `Ok(None)` if `buf` does not
    /// yet hold a complete value — in that case no bytes are consumed
    /// beyond already-framed children, and the in-progress array state is
    /// kept in `self.pending` for the next call.
    ///
    /// Completed values are folded into their parent frame, and parent
    /// frames are closed, in a loop rather than by recursion, so neither a
    /// very wide nor a very deep array can grow the call stack.
    pub fn decode(&mut self, buf: &mut BytesMut) -> RedisResult<Option<Value>> {
        loop {
            match self.step(buf)? {
                Step::NeedMore => return Ok(None),
                Step::Pushed => continue,
                Step::Done(mut value) => loop {
                    match self.pending.last_mut() {
                        Some(frame) => {
                            frame.items.push(value);
                            frame.remaining -= 1;
                            if frame.remaining > 0 {
                                break;
                            }
                            let frame = self.pending.pop().unwrap();
                            value = Value::Bulk(frame.items);
                        }
                        None => return Ok(Some(value)),
                    }
                },
            }
        }
    }

    /// Parses exactly one value header (and its scalar payload, if any)
    /// starting at the current buffer position. An array header pushes a
    /// new frame and returns `Pushed` so the driving loop proceeds
    /// straight to its first child, using whatever is already buffered.
    fn step(&mut self, buf: &mut BytesMut) -> RedisResult<Step> {
        let Some(line_end) = find_crlf(buf) else {
            return Ok(Step::NeedMore);
        };
        let marker = buf[0];
        let line = buf[1..line_end].to_vec();
        match marker {
            b'+' => {
                buf.advance(line_end + 2);
                let text = String::from_utf8(line)
                    .map_err(|_| protocol_error("invalid UTF-8 in simple string"))?;
                if text == "OK" {
                    Ok(Step::Done(Value::Okay))
                } else {
                    Ok(Step::Done(Value::Status(text)))
                }
            }
            b'-' => {
                buf.advance(line_end + 2);
                let text = String::from_utf8(line)
                    .map_err(|_| protocol_error("invalid UTF-8 in error string"))?;
                Err(parse_redis_error(&text))
            }
            b':' => {
                buf.advance(line_end + 2);
                let text = std::str::from_utf8(&line)
                    .map_err(|_| protocol_error("invalid UTF-8 in integer"))?;
                let n: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| protocol_error("invalid integer"))?;
                Ok(Step::Done(Value::Int(n)))
            }
            b'$' => {
                let text = std::str::from_utf8(&line)
                    .map_err(|_| protocol_error("invalid UTF-8 in bulk length"))?;
                let len: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| protocol_error("invalid bulk length"))?;
                if len < 0 {
                    buf.advance(line_end + 2);
                    return Ok(Step::Done(Value::Nil));
                }
                let len = len as usize;
                let total_needed = line_end + 2 + len + 2;
                if buf.len() < total_needed {
                    buf.reserve(total_needed - buf.len());
                    return Ok(Step::NeedMore);
                }
                let data = buf[line_end + 2..line_end + 2 + len].to_vec();
                buf.advance(total_needed);
                Ok(Step::Done(Value::Data(data)))
            }
            b'*' => {
                let text = std::str::from_utf8(&line)
                    .map_err(|_| protocol_error("invalid UTF-8 in array length"))?;
                let len: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| protocol_error("invalid array length"))?;
                buf.advance(line_end + 2);
                if len < 0 {
                    return Ok(Step::Done(Value::Nil));
                }
                if len == 0 {
                    return Ok(Step::Done(Value::Bulk(Vec::new())));
                }
                let preallocate = (len as usize).min(4096);
                self.pending.push(ArrayFrame { remaining: len as usize, items: Vec::with_capacity(preallocate) });
                Ok(Step::Pushed)
            }
            other => Err(protocol_error_detail("unknown RESP type byte", format!("{:?}", other as char))),
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.iter().position(|&b| b == b'\r').and_then(|i| {
        if buf.get(i + 1) == Some(&b'\n') {
            Some(i)
        } else {
            None
        }
    })
}

fn protocol_error(msg: &'static str) -> RedisError {
    RedisError::from((ErrorKind::TypeError, msg))
}

fn protocol_error_detail(msg: &'static str, detail: String) -> RedisError {
    RedisError::from((ErrorKind::TypeError, msg, detail))
}

/// Splits a RESP error line on its first space and maps the leading token
/// to a typed [`ErrorKind`], per the table in the protocol design.
pub fn parse_redis_error(text: &str) -> RedisError {
    let mut parts = text.splitn(2, ' ');
    let token = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").to_string();
    let kind = match token {
        "MOVED" => ErrorKind::Moved,
        "ASK" => ErrorKind::Ask,
        "TRYAGAIN" => ErrorKind::TryAgain,
        "CLUSTERDOWN" => ErrorKind::ClusterDown,
        "LOADING" => ErrorKind::BusyLoadingError,
        "READONLY" => ErrorKind::ReadOnly,
        "NOSCRIPT" => ErrorKind::NoScriptError,
        "EXECABORT" => ErrorKind::ExecAbortError,
        "NOAUTH" | "WRONGPASS" => ErrorKind::AuthenticationFailed,
        "NOPERM" => ErrorKind::NoPermission,
        _ => ErrorKind::ResponseError,
    };
    if rest.is_empty() {
        RedisError::from((kind, "response error", text.to_string()))
    } else {
        RedisError::from((kind, "response error", rest))
    }
}

/// Incrementally reads and decodes one value from an `AsyncRead`, used by
/// the single-shot [`crate::aio::Connection`] path where we own the
/// socket directly rather than going through a `Framed` codec.
pub async fn read_value<R>(
    decoder: &mut ValueDecoder,
    buf: &mut BytesMut,
    mut reader: R,
    read_chunk: usize,
) -> RedisResult<Value>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    loop {
        if let Some(value) = decoder.decode(buf)? {
            return Ok(value);
        }
        let base = buf.len();
        buf.resize(base + read_chunk, 0);
        let n = reader.read(&mut buf[base..]).await?;
        buf.truncate(base + n);
        if n == 0 {
            return Err(RedisError::from((
                ErrorKind::ConnectionDropped,
                "server closed the connection",
            )));
        }
    }
}

/// `tokio_util::codec::Decoder` adapter so a socket can be wrapped in a
/// `Framed` stream for the multiplexed connection actor.
#[derive(Default)]
pub struct ValueCodec {
    decoder: ValueDecoder,
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = RedisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, RedisError> {
        self.decoder.decode(src)
    }
}

/// The multiplexed connection writes already-packed command bytes
/// straight through; all RESP encoding happens up front in [`crate::cmd::Cmd`].
impl Encoder<Vec<u8>> for ValueCodec {
    type Error = RedisError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> RedisResult<()> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Value> {
        let mut decoder = ValueDecoder::new();
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(v) = decoder.decode(&mut buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn decodes_simple_string() {
        assert_eq!(decode_all(b"+OK\r\n"), vec![Value::Okay]);
        assert_eq!(decode_all(b"+PONG\r\n"), vec![Value::Status("PONG".into())]);
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode_all(b":1000\r\n"), vec![Value::Int(1000)]);
        assert_eq!(decode_all(b":-5\r\n"), vec![Value::Int(-5)]);
    }

    #[test]
    fn decodes_bulk_string_and_null_bulk() {
        assert_eq!(decode_all(b"$5\r\nhello\r\n"), vec![Value::Data(b"hello".to_vec())]);
        assert_eq!(decode_all(b"$0\r\n\r\n"), vec![Value::Data(vec![])]);
        assert_eq!(decode_all(b"$-1\r\n"), vec![Value::Nil]);
    }

    #[test]
    fn bulk_with_embedded_crlf_and_nul() {
        let payload = b"a\r\nb\0c";
        let mut framed = format!("${}\r\n", payload.len()).into_bytes();
        framed.extend_from_slice(payload);
        framed.extend_from_slice(b"\r\n");
        assert_eq!(decode_all(&framed), vec![Value::Data(payload.to_vec())]);
    }

    #[test]
    fn decodes_nested_array() {
        let input = b"*2\r\n$3\r\nfoo\r\n*2\r\n:1\r\n:2\r\n";
        assert_eq!(
            decode_all(input),
            vec![Value::Bulk(vec![
                Value::Data(b"foo".to_vec()),
                Value::Bulk(vec![Value::Int(1), Value::Int(2)]),
            ])]
        );
    }

    #[test]
    fn null_array_distinct_from_empty_array() {
        assert_eq!(decode_all(b"*-1\r\n"), vec![Value::Nil]);
        assert_eq!(decode_all(b"*0\r\n"), vec![Value::Bulk(vec![])]);
    }

    #[test]
    fn resumes_across_partial_reads() {
        let mut decoder = ValueDecoder::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n$3\r\nbar\r\n");
        let value = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value, Value::Bulk(vec![Value::Data(b"foo".to_vec()), Value::Data(b"bar".to_vec())]));
    }

    #[test]
    fn large_bulk_parses_without_deep_recursion() {
        let payload = vec![b'x'; 2 * 1024 * 1024];
        let mut framed = format!("${}\r\n", payload.len()).into_bytes();
        framed.extend_from_slice(&payload);
        framed.extend_from_slice(b"\r\n");
        let values = decode_all(&framed);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].as_data().unwrap().len(), payload.len());
    }

    #[test]
    fn error_prefix_mapping() {
        assert_eq!(parse_redis_error("MOVED 1234 127.0.0.1:7001").kind(), ErrorKind::Moved);
        assert_eq!(parse_redis_error("ASK 1234 127.0.0.1:7001").kind(), ErrorKind::Ask);
        assert_eq!(parse_redis_error("TRYAGAIN").kind(), ErrorKind::TryAgain);
        assert_eq!(parse_redis_error("CLUSTERDOWN The cluster is down").kind(), ErrorKind::ClusterDown);
        assert_eq!(parse_redis_error("LOADING Redis is loading").kind(), ErrorKind::BusyLoadingError);
        assert_eq!(parse_redis_error("READONLY You can't write").kind(), ErrorKind::ReadOnly);
        assert_eq!(parse_redis_error("NOSCRIPT No matching script").kind(), ErrorKind::NoScriptError);
        assert_eq!(parse_redis_error("EXECABORT Transaction discarded").kind(), ErrorKind::ExecAbortError);
        assert_eq!(parse_redis_error("NOAUTH Authentication required").kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(parse_redis_error("WRONGPASS invalid username-password").kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(parse_redis_error("NOPERM no permission").kind(), ErrorKind::NoPermission);
        assert_eq!(parse_redis_error("ERR unknown command").kind(), ErrorKind::ResponseError);
    }

    #[test]
    fn redirect_target_parses_slot_and_address() {
        let err = parse_redis_error("MOVED 3999 127.0.0.1:6381");
        assert_eq!(err.redirect_target(), Some((3999, "127.0.0.1:6381".to_string())));
    }
}
