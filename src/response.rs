//! Incremental HTTP/1.1 response parsing.
//!
//! [`Parser`] is an explicit state machine over raw bytes, independent of
//! any socket: [`read_response`] drives it from an [`AsyncRead`], feeding
//! whatever fragments arrive. The target API only ever returns fixed-length
//! or empty bodies over fresh connections, which keeps the grammar small:
//!
//! * status line → `status_code`; 204 completes immediately
//! * headers → only `Content-Length` matters; a blank line ends them
//! * body → exactly `Content-Length` bytes, across any number of reads
//!
//! Two timeouts guard the stream, both measured from the last moment data
//! was available: no first byte within 5 seconds yields a synthetic 503, a
//! stall at any later point yields a synthetic 504. Every fragment is
//! mirrored to the diagnostic sink on its way through.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{events::EventSink, exchange::HttpExchange};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("reading response failed: {0}")]
    Io(#[from] std::io::Error),
}

/// No first byte within this window is a 503; no further data is a 504.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    AwaitingStatusLine,
    AwaitingHeaders,
    ReadingBody,
    Done,
}

/// Response parser state machine.
///
/// Feed it byte fragments as they arrive; it transitions through status
/// line, headers and body, and reports completion via [`Parser::is_done`].
#[derive(Debug)]
pub struct Parser {
    state: State,
    status_code: u16,
    content_length: usize,
    line: Vec<u8>,
    body: Vec<u8>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::AwaitingStatusLine,
            status_code: 0,
            content_length: 0,
            line: Vec::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes one fragment of the byte stream.
    ///
    /// May be called with anything from a single byte to the entire
    /// response. Bytes past the declared body length are ignored.
    pub fn feed(&mut self, mut chunk: &[u8], sink: &dyn EventSink) -> Result<()> {
        while !chunk.is_empty() && self.state != State::Done {
            match self.state {
                State::AwaitingStatusLine | State::AwaitingHeaders => {
                    match chunk.iter().position(|&byte| byte == b'\n') {
                        Some(end) => {
                            self.line.extend_from_slice(&chunk[..end]);
                            chunk = &chunk[end + 1..];

                            let mut line = std::mem::take(&mut self.line);
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            self.handle_line(&line, sink)?;
                        }
                        None => {
                            self.line.extend_from_slice(chunk);
                            break;
                        }
                    }
                }
                State::ReadingBody => {
                    let wanted = self.content_length - self.body.len();
                    let take = wanted.min(chunk.len());
                    self.body.extend_from_slice(&chunk[..take]);
                    sink.trace(&String::from_utf8_lossy(&chunk[..take]));
                    chunk = &chunk[take..];

                    if self.body.len() >= self.content_length {
                        self.state = State::Done;
                    }
                }
                State::Done => unreachable!(),
            }
        }

        Ok(())
    }

    /// Yields the parsed exchange, complete or as far as the stream got.
    #[must_use]
    pub fn finish(self) -> HttpExchange {
        HttpExchange::new(self.status_code, self.body)
    }

    fn handle_line(&mut self, line: &[u8], sink: &dyn EventSink) -> Result<()> {
        let text = String::from_utf8_lossy(line);
        sink.trace(&text);

        match self.state {
            State::AwaitingStatusLine => {
                self.status_code = parse_status_line(&text)?;
                self.state = if self.status_code == 204 {
                    State::Done
                } else {
                    State::AwaitingHeaders
                };
            }
            State::AwaitingHeaders => {
                if line.is_empty() {
                    // End of headers. No Content-Length seen means the
                    // target API is sending an empty body, not an unbounded
                    // one.
                    self.state = if self.content_length == 0 {
                        State::Done
                    } else {
                        State::ReadingBody
                    };
                } else if let Some(value) = header_value(&text, "content-length") {
                    self.content_length = value.trim().parse().unwrap_or(0);
                    if self.content_length == 0 {
                        self.state = State::Done;
                    } else {
                        self.body.reserve(self.content_length);
                    }
                }
            }
            State::ReadingBody | State::Done => unreachable!(),
        }

        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<u16> {
    let malformed = || Error::MalformedStatusLine(line.to_owned());

    let rest = line.strip_prefix("HTTP/1.").ok_or_else(malformed)?;
    rest.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(malformed)
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (header, value) = line.split_once(':')?;
    header.eq_ignore_ascii_case(name).then_some(value)
}

/// Reads one complete response from the byte stream.
///
/// Timeouts surface as synthetic exchanges, never as errors: 503 when the
/// server sent nothing at all, 504 when it stalled partway. A connection
/// closed early yields whatever was accumulated.
pub async fn read_response<R>(reader: &mut R, sink: &dyn EventSink) -> Result<HttpExchange>
where
    R: AsyncRead + Unpin,
{
    let mut parser = Parser::new();
    let mut buffer = [0u8; 1024];
    let mut received_any = false;

    sink.trace("<<<< RESPONSE");

    while !parser.is_done() {
        let read = match tokio::time::timeout(READ_TIMEOUT, reader.read(&mut buffer)).await {
            Ok(result) => result?,
            Err(_) => {
                return Ok(if received_any {
                    HttpExchange::response_timeout()
                } else {
                    HttpExchange::connect_timeout()
                });
            }
        };

        if read == 0 {
            break;
        }

        received_any = true;
        parser.feed(&buffer[..read], sink)?;
    }

    Ok(parser.finish())
}
