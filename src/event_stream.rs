//! Framing for the server-sent event stream the control plane pushes tasks
//! down.
//!
//! The wire format is line oriented. Lines are grouped into blocks separated
//! by a blank line; inside a block each line is one of
//!
//! - a comment, starting with `:`, which is ignored,
//! - a `field: value` pair (a single space after the colon is dropped),
//! - a bare `field`, which has an empty value.
//!
//! A finished block becomes a [`StreamEvent`] with `event`, `id` and `data`.
//! Repeated `data` lines are joined with `\n`; unknown fields are ignored.
//! Bytes that are not UTF-8 decode to U+FFFD instead of failing the stream.

use nom::{
    branch::alt,
    bytes::complete::take_till1,
    character::complete::char,
    combinator::{map, opt, rest},
    error::Error,
    sequence::{pair, preceded},
    Finish, IResult,
};
use std::io::BufRead;
use thiserror::Error as ThisError;

/// Errors while reading the event stream.
#[derive(Debug, ThisError)]
pub enum StreamError {
    /// The connection failed or timed out mid-stream.
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    /// A line that is neither a comment nor a field.
    #[error("unparseable line `{0}`")]
    Line(String),
}

/// One parsed line of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    /// The blank line that closes a block.
    Blank,
    /// `: anything`
    Comment(&'a str),
    /// `field: value` or a bare `field`.
    Field(&'a str, &'a str),
}

/// A complete event, as assembled from one block of lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl StreamEvent {
    /// Only `message` events (any case) carry commands for us.
    pub fn is_message(&self) -> bool {
        self.event
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("message"))
    }
}

fn parse_comment(s: &str) -> IResult<&str, Line<'_>> {
    map(preceded(char(':'), rest), Line::Comment)(s)
}

fn parse_value(s: &str) -> IResult<&str, &str> {
    preceded(char(':'), preceded(opt(char(' ')), rest))(s)
}

fn parse_field(s: &str) -> IResult<&str, Line<'_>> {
    map(
        pair(take_till1(|c: char| c == ':'), opt(parse_value)),
        |(field, value)| Line::Field(field, value.unwrap_or("")),
    )(s)
}

/// Classifies a single line, with its line terminator already removed.
pub fn parse_line(s: &str) -> Result<Line<'_>, Error<String>> {
    if s.is_empty() {
        return Ok(Line::Blank);
    }
    match alt((parse_comment, parse_field))(s).finish() {
        Ok((_remaining, line)) => Ok(line),
        Err(Error { input, code }) => Err(Error {
            input: input.to_string(),
            code,
        }),
    }
}

/// Accumulates lines until a blank line completes an event.
#[derive(Debug, Default)]
pub struct EventParser {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    seen_field: bool,
}

impl EventParser {
    /// A parser with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line. Returns the finished event when `line` closes a
    /// block that contained at least one field.
    pub fn push_line(&mut self, line: &str) -> Result<Option<StreamEvent>, StreamError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        match parse_line(line).map_err(|e| StreamError::Line(e.input))? {
            Line::Blank => Ok(self.take()),
            Line::Comment(_) => Ok(None),
            Line::Field(field, value) => {
                self.seen_field = true;
                match field {
                    "event" => self.event = Some(value.to_owned()),
                    "id" => self.id = Some(value.to_owned()),
                    "data" => self.data.push(value.to_owned()),
                    _ => {}
                }
                Ok(None)
            }
        }
    }

    fn take(&mut self) -> Option<StreamEvent> {
        if !std::mem::take(&mut self.seen_field) {
            return None;
        }
        Some(StreamEvent {
            event: self.event.take(),
            id: self.id.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Reads events off a buffered byte stream until it ends or fails.
pub struct EventReader<R> {
    reader: R,
    parser: EventParser,
    line: Vec<u8>,
}

impl<R: BufRead> EventReader<R> {
    /// Wraps a stream positioned at the start of a line.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: EventParser::new(),
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Result<StreamEvent, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                // End of stream. A trailing block without a blank line is
                // incomplete and is dropped.
                Ok(0) => return None,
                Ok(_) => {
                    let raw = self.line.strip_suffix(b"\n").unwrap_or(&self.line);
                    let line = String::from_utf8_lossy(raw);
                    match self.parser.push_line(&line) {
                        Ok(Some(event)) => return Some(Ok(event)),
                        Ok(None) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                }
                Err(e) => return Some(Err(StreamError::Io(e))),
            }
        }
    }
}
