//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies without extra
//! dependencies, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides the line buffer and the output sink.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//!
//! ## Wire Format
//!
//! ```text
//! request:  *<argc>\r\n ( $<len>\r\n <bytes>\r\n ){argc}
//! replies:  +<simple>\r\n | -<error>\r\n | :<int>\r\n
//!           $<len>\r\n<bytes>\r\n | $-1\r\n
//!           *<count>\r\n <reply>{count} | *-1\r\n
//! ```

use std::borrow::Cow;
use std::fmt;
use std::io::{self, BufRead, Read};

use thiserror::Error;

use crate::error::{ClientError, ClientResult};

/// Largest argument accepted by default (1 GiB, exclusive).
pub const DEFAULT_MAX_ARG_LEN: usize = 1 << 30;

/// Printable command text is cut after this many characters.
const COMMAND_DISPLAY_LIMIT: usize = 100;

/// Bulk payloads larger than this are grown while reading instead of
/// preallocated, so a bogus length cannot force a huge allocation up front.
const BULK_PREALLOC_LIMIT: usize = 64 * 1024;

/// Longest reply header line accepted, CRLF included.
const MAX_LINE_LEN: usize = 64 * 1024;

/// A command: verb followed by binary-safe arguments.
///
/// Built once with the builder methods and then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    parts: Vec<Cow<'a, [u8]>>,
}

impl<'a> Command<'a> {
    /// Starts a command with its verb, e.g. `Command::new(b"GET")`.
    pub fn new(verb: &'a [u8]) -> Self {
        Command {
            parts: vec![Cow::Borrowed(verb)],
        }
    }

    /// Appends one argument (borrowed slice or owned bytes).
    pub fn arg(mut self, arg: impl Into<Cow<'a, [u8]>>) -> Self {
        self.parts.push(arg.into());
        self
    }

    /// Appends an integer argument in decimal form.
    pub fn arg_int(self, value: i64) -> Self {
        let (digits, len) = encode_i64(value);
        self.arg(digits[..len].to_vec())
    }

    /// Appends every argument from the iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Cow<'a, [u8]>>,
    {
        self.parts.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn verb(&self) -> &[u8] {
        &self.parts[0]
    }

    /// Number of parts including the verb.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> impl Iterator<Item = &[u8]> {
        self.parts.iter().map(|part| part.as_ref())
    }

    /// Checks the command can be framed: a non-empty verb and no part of
    /// `max_arg_len` bytes or more.
    pub fn validate(&self, max_arg_len: usize) -> ClientResult<()> {
        if self.verb().is_empty() {
            return Err(ClientError::argument("command verb is empty"));
        }
        for part in self.parts() {
            if part.len() >= max_arg_len {
                return Err(ClientError::argument(format!(
                    "argument of {} bytes exceeds the {} byte limit",
                    part.len(),
                    max_arg_len
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        for part in self.parts() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&String::from_utf8_lossy(part));
            if text.len() > COMMAND_DISPLAY_LIMIT {
                break;
            }
        }
        if text.len() > COMMAND_DISPLAY_LIMIT {
            let mut cut = COMMAND_DISPLAY_LIMIT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...");
        }
        f.write_str(&text)
    }
}

/// RESP reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// +OK or +PONG style replies.
    Simple(String),
    /// -ERR ... replies, with a leading `ERR ` removed.
    Error(String),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, possibly nested. A null array decodes as empty.
    Array(Vec<Reply>),
}

impl Reply {
    /// Short name of the reply kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Simple(_) => "simple",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
        }
    }

    /// Integer value of the reply.
    ///
    /// Rank-style commands answer with a bulk string holding the number, so a
    /// bulk payload of decimal digits is accepted as well.
    pub fn into_integer(self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(value),
            Reply::Bulk(Some(data)) => parse_i64(&data).ok(),
            _ => None,
        }
    }

    /// Floating point value of a bulk reply; NaN when absent or unparsable.
    pub fn into_f64(self) -> f64 {
        match self {
            Reply::Bulk(Some(data)) => parse_f64(&data),
            _ => f64::NAN,
        }
    }
}

/// Destination for encoded command bytes.
pub trait FrameSink {
    fn put(&mut self, bytes: &[u8]);
}

impl FrameSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Failure while decoding one reply.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Socket-level read failure (timeout, reset).
    #[error("io error: {0}")]
    Io(io::Error),
    /// Framing violation, including a stream that ended mid-reply.
    #[error("{0}")]
    Protocol(String),
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::Protocol("unexpected end of stream".to_string())
        } else {
            DecodeError::Io(err)
        }
    }
}

fn protocol(message: impl Into<String>) -> DecodeError {
    DecodeError::Protocol(message.into())
}

/// Encodes a RESP2 array command into the provided sink.
///
/// Parts are validated against `max_arg_len` before anything is written.
pub fn encode_command<S: FrameSink>(
    command: &Command<'_>,
    max_arg_len: usize,
    out: &mut S,
) -> ClientResult<()> {
    command.validate(max_arg_len)?;

    let (header, len) = length_header(b'*', command.len());
    out.put(&header[..len]);
    for part in command.parts() {
        let (header, len) = length_header(b'$', part.len());
        out.put(&header[..len]);
        out.put(part);
        out.put(b"\r\n");
    }
    Ok(())
}

/// Reads one RESP reply from the buffered reader.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> Result<Reply, DecodeError> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(protocol("zero length reply"));
    }

    match line_buf[0] {
        b'+' => Ok(Reply::Simple(String::from_utf8_lossy(&line_buf[1..]).into_owned())),
        b'-' => {
            let text = String::from_utf8_lossy(&line_buf[1..]).into_owned();
            let message = text.strip_prefix("ERR ").map(str::to_string).unwrap_or(text);
            Ok(Reply::Error(message))
        }
        b':' => Ok(Reply::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            read_bulk(reader, len)
        }
        b'*' => {
            let count = parse_i64(&line_buf[1..])?;
            read_array(reader, count, line_buf)
        }
        other => Err(protocol(format!(
            "unexpected reply: {}{}",
            other as char,
            String::from_utf8_lossy(&line_buf[1..])
        ))),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> Result<Reply, DecodeError> {
    if len == -1 {
        return Ok(Reply::Bulk(None));
    }
    if len < 0 {
        return Err(protocol(format!("invalid bulk length {}", len)));
    }

    let len = len as usize;
    let mut data = Vec::with_capacity(len.min(BULK_PREALLOC_LIMIT));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(protocol("unexpected end of stream"));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(protocol("invalid termination"));
    }

    Ok(Reply::Bulk(Some(data)))
}

fn read_array<R: BufRead>(
    reader: &mut R,
    count: i64,
    line_buf: &mut Vec<u8>,
) -> Result<Reply, DecodeError> {
    if count == -1 {
        return Ok(Reply::Array(Vec::new()));
    }
    if count < 0 {
        return Err(protocol(format!("invalid array length {}", count)));
    }

    let mut items = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        items.push(read_reply(reader, line_buf)?);
    }
    Ok(Reply::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), DecodeError> {
    buf.clear();
    let bytes = reader.by_ref().take(MAX_LINE_LEN as u64).read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(protocol("no more data"));
    }
    if bytes == MAX_LINE_LEN && buf.last() != Some(&b'\n') {
        return Err(protocol(format!("reply line exceeds {} bytes", MAX_LINE_LEN)));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(protocol("unterminated line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> Result<i64, DecodeError> {
    let invalid = || protocol(format!("invalid integer {:?}", String::from_utf8_lossy(data)));

    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(invalid());
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or_else(invalid)?;
    }

    Ok(if negative { -value } else { value })
}

/// Parses a decimal payload the same way regardless of locale.
pub fn parse_f64(data: &[u8]) -> f64 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.trim().parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

fn length_header(prefix: u8, value: usize) -> ([u8; 24], usize) {
    // Stack buffer keeps header framing allocation-free.
    let mut buf = [0u8; 24];
    buf[0] = prefix;
    let (digits, len) = encode_u64(value as u64);
    buf[1..1 + len].copy_from_slice(&digits[..len]);
    buf[1 + len] = b'\r';
    buf[2 + len] = b'\n';
    (buf, len + 3)
}

fn encode_i64(value: i64) -> ([u8; 21], usize) {
    let mut buf = [0u8; 21];
    let (digits, len) = encode_u64(value.unsigned_abs());
    if value < 0 {
        buf[0] = b'-';
        buf[1..1 + len].copy_from_slice(&digits[..len]);
        (buf, len + 1)
    } else {
        buf[..len].copy_from_slice(&digits[..len]);
        (buf, len)
    }
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    let mut buf = [0u8; 20];
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    let mut len = 0;
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
