//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server responses,
//! keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::fmt;
use std::io::{self, BufRead, Read};

use crate::error::{ClientError, ClientResult};

/// RESP response value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays. A null array is read as empty.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Turns an error reply into `ClientError::Server`, passing other values through.
    pub fn into_result(self) -> ClientResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(ClientError::Server {
                message: String::from_utf8_lossy(&message).into_owned(),
            }),
            other => Ok(other),
        }
    }

    /// Accepts any non-error reply as an acknowledgement.
    pub fn into_ack(self) -> ClientResult<()> {
        self.into_result().map(|_| ())
    }

    /// Reads a single string; a nil bulk reply becomes `ClientError::Nil`.
    pub fn into_string(self) -> ClientResult<String> {
        match self.into_result()? {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Ok(String::from_utf8(data)?),
            RespValue::Integer(value) => Ok(value.to_string()),
            RespValue::Bulk(None) => Err(ClientError::Nil),
            RespValue::Array(_) => Err(ClientError::UnexpectedResponse),
            RespValue::Error(_) => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Reads a single string, mapping nil to `None`.
    pub fn into_optional_string(self) -> ClientResult<Option<String>> {
        match self.into_string() {
            Ok(value) => Ok(Some(value)),
            Err(ClientError::Nil) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn into_integer(self) -> ClientResult<i64> {
        match self.into_result()? {
            RespValue::Integer(value) => Ok(value),
            RespValue::Bulk(Some(data)) | RespValue::Simple(data) => parse_number(&data),
            RespValue::Bulk(None) => Err(ClientError::Nil),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Reads a score; the store sends doubles as bulk strings ("1.5", "inf").
    pub fn into_f64(self) -> ClientResult<f64> {
        match self.into_result()? {
            RespValue::Integer(value) => Ok(value as f64),
            RespValue::Bulk(Some(data)) | RespValue::Simple(data) => parse_number(&data),
            RespValue::Bulk(None) => Err(ClientError::Nil),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Reads an array whose elements are all non-nil strings.
    pub fn into_list(self) -> ClientResult<Vec<String>> {
        self.into_array()?
            .into_iter()
            .map(RespValue::into_string)
            .collect()
    }

    /// Reads an array where nil elements are allowed.
    pub fn into_optional_list(self) -> ClientResult<Vec<Option<String>>> {
        self.into_array()?
            .into_iter()
            .map(RespValue::into_optional_string)
            .collect()
    }

    /// Reads a flat `[a1, b1, a2, b2, ...]` array into pairs.
    pub fn into_pairs(self) -> ClientResult<Vec<(String, String)>> {
        let items = self.into_list()?;
        if items.len() % 2 != 0 {
            return Err(ClientError::UnexpectedResponse);
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(first), Some(second)) = (iter.next(), iter.next()) {
            pairs.push((first, second));
        }
        Ok(pairs)
    }

    pub fn into_array(self) -> ClientResult<Vec<RespValue>> {
        match self.into_result()? {
            RespValue::Array(items) => Ok(items),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

fn parse_number<T: std::str::FromStr>(data: &[u8]) -> ClientResult<T> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ClientError::InvalidNumber(String::from_utf8_lossy(data).into_owned()))?;
    text.parse()
        .map_err(|_| ClientError::InvalidNumber(text.to_string()))
}

/// Converts a value into one command argument.
///
/// Numbers are written in their literal decimal form, strings verbatim.
pub trait ToArg {
    fn write_arg(&self, out: &mut Vec<u8>);
}

impl ToArg for str {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for String {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for [u8] {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToArg for Vec<u8> {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn write_arg(&self, out: &mut Vec<u8>) {
        (**self).write_arg(out);
    }
}

macro_rules! integer_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn write_arg(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(self.to_string().as_bytes());
                }
            }
        )*
    };
}

integer_arg!(i32, i64, u32, u64, usize);

impl ToArg for f64 {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(format_score(*self).as_bytes());
    }
}

/// Renders a score the way the store parses it: infinities as `+inf`/`-inf`.
pub(crate) fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// A command name plus its ordered arguments, ready for encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Command {
            args: vec![name.as_bytes().to_vec()],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, value: impl ToArg) -> Self {
        let mut buf = Vec::new();
        value.write_arg(&mut buf);
        self.args.push(buf);
        self
    }

    /// Appends every item of `values`, preserving order.
    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        for value in values {
            self = self.arg(value);
        }
        self
    }

    /// Returns the command name as sent.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Returns every argument, the command name included.
    pub fn parts(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Encodes this command as a RESP2 array into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(b'*');
        push_usize(out, self.args.len());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.push(b'$');
            push_usize(out, arg.len());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
    }
}

// Never print AUTH arguments.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = String::from_utf8_lossy(self.name());
        if name.eq_ignore_ascii_case("AUTH") {
            return write!(f, "Command(AUTH ***)");
        }
        let mut list = f.debug_tuple("Command");
        for arg in &self.args {
            list.field(&String::from_utf8_lossy(arg));
        }
        list.finish()
    }
}

/// Largest bulk string accepted from a reply.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest element count accepted in a reply array.
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

// Up-front allocation for a reply; larger ones grow as data arrives.
const ARRAY_PREALLOC: usize = 1024;
const BULK_PREALLOC: usize = 64 * 1024;

/// Reads one RESP value from the buffered reader.
///
/// Headers announcing more than `MAX_BULK_LEN` bytes or `MAX_ARRAY_LEN`
/// elements are rejected with `ClientError::Protocol`.
pub fn read_response<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let len = usize::try_from(len).map_err(|_| ClientError::Protocol)?;
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol);
    }
    let mut data = Vec::with_capacity(len.min(BULK_PREALLOC));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() < len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len <= 0 {
        return Ok(RespValue::Array(Vec::new()));
    }

    let len = usize::try_from(len).map_err(|_| ClientError::Protocol)?;
    if len > MAX_ARRAY_LEN {
        return Err(ClientError::Protocol);
    }

    let mut items = Vec::with_capacity(len.min(ARRAY_PREALLOC));
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
