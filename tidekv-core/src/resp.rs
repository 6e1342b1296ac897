//! RESP framing
//!
//! Just enough of the Redis Serialization Protocol to read client commands,
//! write replies, and produce the multi-bulk bytes that flow into the WAL and
//! the replication stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest bulk string accepted from the wire (512 MB, same as Redis)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest multi-bulk element count accepted from the wire
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Longest inline command line accepted before a CRLF must appear
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// RESP framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RespError {
    #[error("Protocol error: invalid type byte '{0}'")]
    InvalidType(char),

    #[error("Protocol error: invalid length '{0}'")]
    InvalidLength(String),

    #[error("Protocol error: invalid integer '{0}'")]
    InvalidInteger(String),

    #[error("Protocol error: missing CRLF after bulk payload")]
    MissingCrlf,

    #[error("Protocol error: inline command too long")]
    InlineTooLong,

    #[error("Protocol error: expected a command array")]
    NotACommand,
}

/// A single RESP value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    NullArray,
    Array(Vec<Frame>),
}

impl Frame {
    pub fn ok() -> Self {
        Frame::Simple("OK".to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(message.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame, and
    /// `Ok(Some((frame, consumed)))` otherwise. Buffers that do not start with
    /// a RESP type byte are parsed as inline commands.
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            b'+' | b'-' | b':' | b'$' | b'*' => parse_typed(buf, 0),
            _ => parse_inline(buf),
        }
    }

    /// Encode this frame into its wire representation
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                out.put_u8(b'+');
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
            Frame::Error(s) => {
                out.put_u8(b'-');
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                out.put_u8(b':');
                out.put_slice(n.to_string().as_bytes());
                out.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                out.put_u8(b'$');
                out.put_slice(data.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                out.put_slice(data);
                out.put_slice(b"\r\n");
            }
            Frame::Null => out.put_slice(b"$-1\r\n"),
            Frame::NullArray => out.put_slice(b"*-1\r\n"),
            Frame::Array(items) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }

    /// Interpret this frame as a command: a non-empty array of bulk strings
    pub fn into_args(self) -> Result<Vec<Bytes>, RespError> {
        let Frame::Array(items) = self else {
            return Err(RespError::NotACommand);
        };
        if items.is_empty() {
            return Err(RespError::NotACommand);
        }

        items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(data) => Ok(data),
                Frame::Simple(s) => Ok(Bytes::from(s)),
                Frame::Integer(n) => Ok(Bytes::from(n.to_string())),
                _ => Err(RespError::NotACommand),
            })
            .collect()
    }
}

/// Encode a command as a RESP multi-bulk array
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Bytes {
    let mut out = BytesMut::with_capacity(16 + args.iter().map(|a| a.as_ref().len() + 16).sum::<usize>());
    out.put_u8(b'*');
    out.put_slice(args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        out.put_slice(arg.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
    out.freeze()
}

/// Find the index of the first CRLF at or after `from`
pub fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + 2 {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos)
}

fn parse_typed(buf: &[u8], start: usize) -> Result<Option<(Frame, usize)>, RespError> {
    if start >= buf.len() {
        return Ok(None);
    }
    let Some(line_end) = find_crlf(buf, start + 1) else {
        return Ok(None);
    };
    let line = &buf[start + 1..line_end];
    let after_line = line_end + 2;

    match buf[start] {
        b'+' => Ok(Some((
            Frame::Simple(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            Frame::Error(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b':' => Ok(Some((Frame::Integer(parse_integer(line)?), after_line))),
        b'$' => {
            let len = parse_integer(line)?;
            if len == -1 {
                return Ok(Some((Frame::Null, after_line)));
            }
            let len = checked_len(len, MAX_BULK_LEN, line)?;
            if buf.len() < after_line + len + 2 {
                return Ok(None);
            }
            if &buf[after_line + len..after_line + len + 2] != b"\r\n" {
                return Err(RespError::MissingCrlf);
            }
            let data = Bytes::copy_from_slice(&buf[after_line..after_line + len]);
            Ok(Some((Frame::Bulk(data), after_line + len + 2)))
        }
        b'*' => {
            let count = parse_integer(line)?;
            if count == -1 {
                return Ok(Some((Frame::NullArray, after_line)));
            }
            let count = checked_len(count, MAX_ARRAY_LEN, line)?;
            let mut items = Vec::with_capacity(count.min(64));
            let mut cursor = after_line;
            for _ in 0..count {
                match parse_typed(buf, cursor)? {
                    Some((item, next)) => {
                        items.push(item);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), cursor)))
        }
        other => Err(RespError::InvalidType(other as char)),
    }
}

fn parse_inline(buf: &[u8]) -> Result<Option<(Frame, usize)>, RespError> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_INLINE_LEN {
            return Err(RespError::InlineTooLong);
        }
        return Ok(None);
    };

    let mut line = &buf[..newline];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    let items = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| Frame::Bulk(Bytes::copy_from_slice(part)))
        .collect();

    Ok(Some((Frame::Array(items), newline + 1)))
}

fn parse_integer(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

fn checked_len(len: i64, max: usize, line: &[u8]) -> Result<usize, RespError> {
    if len < 0 || len as u64 > max as u64 {
        return Err(RespError::InvalidLength(String::from_utf8_lossy(line).into_owned()));
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_array() {
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n";
        let (frame, consumed) = Frame::parse(input).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        let args = frame.into_args().unwrap();
        assert_eq!(args, vec![Bytes::from("SET"), Bytes::from("a"), Bytes::from("1")]);
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(Frame::parse(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
        assert_eq!(Frame::parse(b"$5\r\nhel").unwrap(), None);
        assert_eq!(Frame::parse(b"+OK").unwrap(), None);
    }

    #[test]
    fn test_parse_inline() {
        let (frame, consumed) = Frame::parse(b"PING  hello\r\nrest").unwrap().unwrap();
        assert_eq!(consumed, 13);
        assert_eq!(
            frame.into_args().unwrap(),
            vec![Bytes::from("PING"), Bytes::from("hello")]
        );
    }

    #[test]
    fn test_bulk_missing_crlf() {
        assert_eq!(Frame::parse(b"$3\r\nabcXY"), Err(RespError::MissingCrlf));
    }

    #[test]
    fn test_negative_length_rejected() {
        assert!(matches!(
            Frame::parse(b"$-5\r\n"),
            Err(RespError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_encode_command_matches_parse() {
        let encoded = encode_command(&["SET", "a", "1"]);
        assert_eq!(&encoded[..], b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
        assert_eq!(encoded.len(), 27);
    }

    #[test]
    fn test_encode_replies() {
        assert_eq!(&Frame::ok().encode()[..], b"+OK\r\n");
        assert_eq!(&Frame::Integer(-3).encode()[..], b":-3\r\n");
        assert_eq!(&Frame::Null.encode()[..], b"$-1\r\n");
        assert_eq!(
            &Frame::Array(vec![Frame::bulk("a"), Frame::Null]).encode()[..],
            b"*2\r\n$1\r\na\r\n$-1\r\n"
        );
    }
}
