//! Streaming RESP parser.
//!
//! The parser wraps any `BufRead` source and yields a lazy sequence of
//! parse outcomes. A malformed frame produces `Payload::Protocol` with the
//! offending line and the stream keeps going; only I/O failure or EOF ends
//! iteration, so the caller decides how strict to be.

use std::io::{self, BufRead, ErrorKind};

use crate::reply::{CmdLine, Reply};

/// Upper bound on one bulk payload; larger length prefixes are framing errors.
const MAX_BULK_BYTES: i64 = 512 << 20;
/// Upper bound on one array header; larger counts are framing errors.
const MAX_ARRAY_LEN: i64 = 1 << 20;

/// One outcome of the parse stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A complete frame: inline command, bulk, status, error, integer, or array.
    Frame(Reply),
    /// A framing error, carrying diagnostic text with the offending input.
    Protocol(String),
}

impl Payload {
    /// Converts a request frame into an argv vector.
    ///
    /// Inline commands and arrays of bulk strings are the two accepted
    /// request framings; a lone bulk string is treated as a one-argument
    /// command for symmetry with pipelined peers.
    #[must_use]
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        match self {
            Self::Frame(Reply::Array(items)) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Reply::Bulk(arg) => args.push(arg),
                        Reply::NullBulk => args.push(Vec::new()),
                        _ => return None,
                    }
                }
                Some(args)
            }
            Self::Frame(Reply::Bulk(arg)) => Some(vec![arg]),
            _ => None,
        }
    }
}

/// Streaming parser over a buffered byte source.
#[derive(Debug)]
pub struct RespParser<R: BufRead> {
    reader: R,
    done: bool,
}

impl<R: BufRead> RespParser<R> {
    /// Wraps a buffered reader into a parse stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// Reads one CRLF-terminated line, excluding the terminator.
    ///
    /// Returns `Ok(None)` at clean EOF.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(None);
        }
        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        } else {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "stream ended inside a frame line",
            ));
        }
        Ok(Some(line))
    }

    fn parse_frame(&mut self, line: Vec<u8>) -> io::Result<Payload> {
        match line.first() {
            Some(b'*') => self.parse_array(&line),
            Some(b'$') => self.parse_bulk(&line),
            Some(b'+') => Ok(Payload::Frame(Reply::Status(lossy(&line[1..])))),
            Some(b'-') => Ok(Payload::Frame(Reply::Error(lossy(&line[1..])))),
            Some(b':') => match parse_decimal(&line[1..]) {
                Some(value) => Ok(Payload::Frame(Reply::Integer(value))),
                None => Ok(protocol_error("illegal integer", &line)),
            },
            Some(_) => Ok(parse_inline(&line)),
            None => unreachable!("empty lines are skipped before frame parsing"),
        }
    }

    fn parse_array(&mut self, header: &[u8]) -> io::Result<Payload> {
        let Some(count) = parse_decimal(&header[1..]) else {
            return Ok(protocol_error("illegal array header", header));
        };
        if count == -1 {
            return Ok(Payload::Frame(Reply::NullArray));
        }
        if count < 0 || count > MAX_ARRAY_LEN {
            return Ok(protocol_error("illegal array length", header));
        }
        let mut items = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            let Some(line) = self.read_line()? else {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside an array frame",
                ));
            };
            if line.is_empty() {
                return Ok(protocol_error("empty line inside array", header));
            }
            match self.parse_frame(line)? {
                Payload::Frame(item) => items.push(item),
                Payload::Protocol(detail) => return Ok(Payload::Protocol(detail)),
            }
        }
        Ok(Payload::Frame(Reply::Array(items)))
    }

    fn parse_bulk(&mut self, header: &[u8]) -> io::Result<Payload> {
        let Some(length) = parse_decimal(&header[1..]) else {
            return Ok(protocol_error("illegal bulk header", header));
        };
        if length == -1 {
            return Ok(Payload::Frame(Reply::NullBulk));
        }
        if length < 0 || length > MAX_BULK_BYTES {
            return Ok(protocol_error("illegal bulk length", header));
        }
        let body_len = usize::try_from(length).unwrap_or(0);
        let mut body = vec![0_u8; body_len + 2];
        self.reader.read_exact(&mut body)?;
        if body[body_len..] != *b"\r\n" {
            return Ok(protocol_error("bulk payload missing CRLF", header));
        }
        body.truncate(body_len);
        Ok(Payload::Frame(Reply::Bulk(body)))
    }
}

impl<R: BufRead> Iterator for RespParser<R> {
    type Item = io::Result<Payload>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            };
            if line.is_empty() {
                continue;
            }
            return match self.parse_frame(line) {
                Ok(payload) => Some(Ok(payload)),
                Err(error) => {
                    self.done = true;
                    Some(Err(error))
                }
            };
        }
    }
}

/// Parses an inline space-separated command into an array-of-bulk frame.
fn parse_inline(line: &[u8]) -> Payload {
    let args: CmdLine = line
        .split(|byte| byte.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    if args.is_empty() {
        return protocol_error("blank inline command", line);
    }
    Payload::Frame(Reply::Array(args.into_iter().map(Reply::Bulk).collect()))
}

fn parse_decimal(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn protocol_error(detail: &str, line: &[u8]) -> Payload {
    Payload::Protocol(format!(
        "ERR Protocol error: {detail}: {:?}",
        String::from_utf8_lossy(line)
    ))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::{Payload, RespParser};
    use crate::reply::Reply;
    use googletest::prelude::*;
    use rstest::rstest;

    fn parse_all(input: &[u8]) -> Vec<Payload> {
        RespParser::new(input)
            .map(|outcome| outcome.expect("in-memory parse must not fail on io"))
            .collect()
    }

    #[rstest]
    fn parses_array_of_bulk_request() {
        let outcomes = parse_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\njack\r\n");
        assert_that!(outcomes.len(), eq(1_usize));
        let args = outcomes[0].clone().into_cmd_line().expect("request frame");
        assert_that!(args.len(), eq(3_usize));
        assert_that!(args[2].as_slice(), eq(b"jack".as_slice()));
    }

    #[rstest]
    fn parses_inline_command() {
        let outcomes = parse_all(b"GET name\r\n");
        let args = outcomes[0].clone().into_cmd_line().expect("inline frame");
        assert_that!(args[0].as_slice(), eq(b"GET".as_slice()));
        assert_that!(args[1].as_slice(), eq(b"name".as_slice()));
    }

    #[rstest]
    fn distinguishes_null_array_from_empty() {
        let outcomes = parse_all(b"*-1\r\n*0\r\n");
        assert_that!(outcomes[0], eq(&Payload::Frame(Reply::NullArray)));
        assert_that!(outcomes[1], eq(&Payload::Frame(Reply::Array(Vec::new()))));
    }

    #[rstest]
    fn parses_reply_kinds() {
        let outcomes = parse_all(b"+OK\r\n-ERR boom\r\n:42\r\n$-1\r\n");
        assert_that!(outcomes[0], eq(&Payload::Frame(Reply::Status("OK".to_owned()))));
        assert_that!(outcomes[1], eq(&Payload::Frame(Reply::Error("ERR boom".to_owned()))));
        assert_that!(outcomes[2], eq(&Payload::Frame(Reply::Integer(42))));
        assert_that!(outcomes[3], eq(&Payload::Frame(Reply::NullBulk)));
    }

    #[rstest]
    fn framing_error_does_not_stop_the_stream() {
        let outcomes = parse_all(b"$abc\r\nPING\r\n");
        assert_that!(matches!(outcomes[0], Payload::Protocol(_)), eq(true));
        let args = outcomes[1].clone().into_cmd_line().expect("inline frame");
        assert_that!(args[0].as_slice(), eq(b"PING".as_slice()));
    }

    #[rstest]
    fn bulk_payload_is_binary_safe() {
        let outcomes = parse_all(b"$6\r\na\r\nb\r\r\n");
        assert_that!(
            outcomes[0],
            eq(&Payload::Frame(Reply::Bulk(b"a\r\nb\r".to_vec())))
        );
    }

    #[rstest]
    fn truncated_bulk_surfaces_io_error() {
        let mut parser = RespParser::new(b"$10\r\nshort\r\n".as_slice());
        let outcome = parser.next().expect("one outcome");
        assert_that!(outcome.is_err(), eq(true));
        assert_that!(parser.next().is_none(), eq(true));
    }
}
