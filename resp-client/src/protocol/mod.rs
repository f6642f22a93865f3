use bytes::{Buf, BufMut, Bytes, BytesMut};
use datastore::{Command, Reply};
use shared::{Error, Result};
use tokio_util::codec::{Decoder, Encoder};

// Reply type identifiers
pub const RESP_STATUS: u8 = b'+';
pub const RESP_ERROR: u8 = b'-';
pub const RESP_INTEGER: u8 = b':';
pub const RESP_BULK: u8 = b'$';
pub const RESP_ARRAY: u8 = b'*';

const CRLF: &[u8] = b"\r\n";

/// Same ceiling the server applies to a single bulk string.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Longest header line accepted before the frame is declared malformed.
const MAX_LINE_LEN: usize = 64 * 1024;

/// RESP2 codec: encodes commands as arrays of bulk strings and decodes
/// replies of every RESP2 type.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Encoder<Command> for RespCodec {
    type Error = Error;

    /// Format: `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` for the
    /// command name and each argument.
    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        let payload: usize = command.args().iter().map(|a| a.len() + 16).sum();
        dst.reserve(payload + command.name().len() + 32);

        put_header(dst, RESP_ARRAY, (command.args().len() + 1) as i64);
        put_bulk(dst, command.name().as_bytes());
        for arg in command.args() {
            put_bulk(dst, arg);
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>> {
        match parse(src, 0)? {
            Some((reply, consumed)) => {
                src.advance(consumed);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

/// Encode a reply the way a server would send it.
pub fn encode_reply(reply: &Reply, dst: &mut BytesMut) {
    match reply {
        Reply::Status(s) => put_line(dst, RESP_STATUS, s.as_bytes()),
        Reply::Error(msg) => put_line(dst, RESP_ERROR, msg.as_bytes()),
        Reply::Integer(n) => put_header(dst, RESP_INTEGER, *n),
        Reply::Bulk(None) => put_header(dst, RESP_BULK, -1),
        Reply::Bulk(Some(bytes)) => put_bulk(dst, bytes),
        Reply::Array(None) => put_header(dst, RESP_ARRAY, -1),
        Reply::Array(Some(items)) => {
            put_header(dst, RESP_ARRAY, items.len() as i64);
            for item in items {
                encode_reply(item, dst);
            }
        }
    }
}

fn put_line(dst: &mut BytesMut, kind: u8, line: &[u8]) {
    dst.put_u8(kind);
    dst.put_slice(line);
    dst.put_slice(CRLF);
}

fn put_header(dst: &mut BytesMut, kind: u8, n: i64) {
    put_line(dst, kind, n.to_string().as_bytes());
}

fn put_bulk(dst: &mut BytesMut, bytes: &[u8]) {
    put_header(dst, RESP_BULK, bytes.len() as i64);
    dst.put_slice(bytes);
    dst.put_slice(CRLF);
}

/// Parses one reply starting at `pos`. Returns the reply and the offset just
/// past it, or `None` when `buf` does not yet hold a complete reply.
fn parse(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match kind {
        RESP_STATUS => Ok(Some((Reply::Status(utf8(line)?), next))),
        RESP_ERROR => Ok(Some((Reply::Error(utf8(line)?), next))),
        RESP_INTEGER => Ok(Some((Reply::Integer(integer(line)?), next))),
        RESP_BULK => {
            let len = integer(line)?;
            if len == -1 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            if !(0..=MAX_BULK_LEN).contains(&len) {
                return Err(Error::Protocol(format!("invalid bulk length {}", len)));
            }
            let len = len as usize;
            let end = next + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(Error::Protocol("bulk string not terminated by CRLF".to_string()));
            }
            let bytes = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((Reply::Bulk(Some(bytes)), end + CRLF.len())))
        }
        RESP_ARRAY => {
            let count = integer(line)?;
            if count == -1 {
                return Ok(Some((Reply::Array(None), next)));
            }
            if count < 0 {
                return Err(Error::Protocol(format!("invalid array length {}", count)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
        other => Err(Error::Protocol(format!(
            "unknown reply type: 0x{:02X}",
            other
        ))),
    }
}

fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>> {
    let rest = buf.get(start..).unwrap_or_default();
    match rest.windows(CRLF.len()).position(|w| w == CRLF) {
        Some(idx) => Ok(Some((&rest[..idx], start + idx + CRLF.len()))),
        None if rest.len() > MAX_LINE_LEN => {
            Err(Error::Protocol("header line exceeds limit".to_string()))
        }
        None => Ok(None),
    }
}

fn utf8(line: &[u8]) -> Result<String> {
    String::from_utf8(line.to_vec()).map_err(|e| Error::Protocol(format!("invalid UTF-8: {}", e)))
}

fn integer(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
