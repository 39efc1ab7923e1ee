//! # RESP2 Request Framing
//!
//! Purpose: Split incoming bytes into commands (arrays of bulk strings) and
//! encode replies.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: An incomplete frame leaves the buffer untouched
//!    and returns `Ok(None)`; the caller reads more and retries.
//! 2. **Bounded Frames**: Oversized counts are protocol errors, not allocations.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Upper bound on arguments per command.
pub const MAX_ARGS: usize = 1024 * 1024;
/// Upper bound on a single bulk argument.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RespError {
    #[error("protocol error")]
    Protocol,
}

/// Stateless parser for client requests.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one command from the front of `buffer`, consuming it on success.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut pos = 0;

        let count = match read_line(buffer, &mut pos) {
            Some(line) => parse_header(line, b'*', MAX_ARGS)?,
            None => return Ok(None),
        };

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let len = match read_line(buffer, &mut pos) {
                Some(line) => parse_header(line, b'$', MAX_BULK_LEN)?,
                None => return Ok(None),
            };
            if buffer.len() < pos + len + 2 {
                return Ok(None);
            }
            if &buffer[pos + len..pos + len + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buffer[pos..pos + len].to_vec());
            pos += len + 2;
        }

        buffer.advance(pos);
        Ok(Some(args))
    }
}

// Returns the line starting at `pos` without its CRLF and moves `pos` past it.
fn read_line<'a>(buffer: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = buffer.get(*pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    *pos += end + 2;
    Some(&rest[..end])
}

fn parse_header(line: &[u8], prefix: u8, max: usize) -> Result<usize, RespError> {
    match line.split_first() {
        Some((&first, digits)) if first == prefix && !digits.is_empty() => {
            let mut value: usize = 0;
            for &b in digits {
                if !b.is_ascii_digit() {
                    return Err(RespError::Protocol);
                }
                value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
            }
            if value > max {
                return Err(RespError::Protocol);
            }
            Ok(value)
        }
        _ => Err(RespError::Protocol),
    }
}

pub fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Error reply; `message` carries its own prefix (`ERR`, `WRONGTYPE`, ...).
pub fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"-");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b":");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    write_bulk(&mut buf, data);
    buf
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_optional(data: Option<&[u8]>) -> Vec<u8> {
    match data {
        Some(data) => resp_bulk(data),
        None => resp_null(),
    }
}

/// Array of bulk strings where `None` items become nil.
pub fn resp_array<'a, I>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = Option<&'a [u8]>>,
    I::IntoIter: ExactSizeIterator,
{
    let items = items.into_iter();
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        match item {
            Some(data) => write_bulk(&mut buf, data),
            None => buf.extend_from_slice(b"$-1\r\n"),
        }
    }
    buf
}

/// Two-element scan reply: cursor, then the page of items.
pub fn resp_scan(cursor: u64, items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*2\r\n");
    write_bulk(&mut buf, cursor.to_string().as_bytes());
    buf.extend(resp_array(items.iter().map(|item| Some(item.as_slice()))));
    buf
}

fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(b"$");
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_command() {
        let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"[..]);
        let args = RespParser::new().parse(&mut buffer).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"k".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn waits_for_partial_frames() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r"[..]);
        assert_eq!(parser.parse(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 16);
        buffer.extend_from_slice(b"\nk\r\n");
        assert!(parser.parse(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn leaves_pipelined_commands_in_buffer() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        assert!(parser.parse(&mut buffer).unwrap().is_some());
        assert!(parser.parse(&mut buffer).unwrap().is_some());
        assert_eq!(parser.parse(&mut buffer).unwrap(), None);
    }

    #[test]
    fn rejects_inline_commands() {
        let mut buffer = BytesMut::from(&b"PING\r\n"[..]);
        assert_eq!(RespParser::new().parse(&mut buffer), Err(RespError::Protocol));
    }

    #[test]
    fn encodes_scan_reply() {
        let reply = resp_scan(0, &[b"a".to_vec()]);
        assert_eq!(reply, b"*2\r\n$1\r\n0\r\n*1\r\n$1\r\na\r\n".to_vec());
    }
}
