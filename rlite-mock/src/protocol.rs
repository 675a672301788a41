//! # RESP Request Parsing
//!
//! Incremental parser for client requests (arrays of bulk strings) plus the
//! reply encoders the server writes back.

use bytes::{Buf, BytesMut};

/// Request framing error; the server answers once and hangs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Protocol,
}

/// Parses complete requests out of a read buffer.
///
/// Incomplete input is left in the buffer untouched until more bytes arrive.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Returns the next request's arguments, or `None` if it is not complete yet.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut cursor = 0;

        let header = match next_line(buf, &mut cursor) {
            Some(line) => line,
            None => return Ok(None),
        };
        if header.first() != Some(&b'*') {
            return Err(RespError::Protocol);
        }
        let count = parse_len(&header[1..])?;

        let mut args = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let line = match next_line(buf, &mut cursor) {
                Some(line) => line,
                None => return Ok(None),
            };
            if line.first() != Some(&b'$') {
                return Err(RespError::Protocol);
            }
            let len = parse_len(&line[1..])?;

            if buf.len() < cursor + len + 2 {
                return Ok(None);
            }
            if &buf[cursor + len..cursor + len + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buf[cursor..cursor + len].to_vec());
            cursor += len + 2;
        }

        buf.advance(cursor);
        Ok(Some(args))
    }
}

fn next_line<'a>(buf: &'a [u8], cursor: &mut usize) -> Option<&'a [u8]> {
    let rest = &buf[*cursor..];
    let end = rest.windows(2).position(|window| window == b"\r\n")?;
    *cursor += end + 2;
    Some(&rest[..end])
}

fn parse_len(digits: &[u8]) -> Result<usize, RespError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(RespError::Protocol);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(RespError::Protocol)
}

pub fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Error reply with the conventional `ERR ` prefix.
pub fn resp_error(message: &str) -> Vec<u8> {
    resp_raw_error(&format!("ERR {}", message))
}

/// Error reply written verbatim, for codes such as `NOAUTH`.
pub fn resp_raw_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"-");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}
