use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;

use crate::Error;

/// An open HTTP response body, or any other chunked byte stream.
pub(crate) type ByteSource = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Buffer over the response body chunk stream.
///
/// Parsers scan `data()` and `consume()` what they have fully decoded;
/// anything incomplete stays buffered until the next chunk arrives. The
/// source is dropped exactly once, on `close()`, which releases the
/// underlying connection.
pub(crate) struct FeedBuffer {
    source: Option<ByteSource>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl FeedBuffer {
    pub(crate) fn new(source: ByteSource) -> Self {
        FeedBuffer {
            source: Some(source),
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// The buffered bytes not yet consumed by a parser.
    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// True once the source has reported end-of-input.
    pub(crate) fn eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.pos += n;
        debug_assert!(self.pos <= self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Polls the source for one more chunk. Returns the number of bytes
    /// added to the buffer; zero means the stream is exhausted.
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, Error>> {
        let Some(source) = self.source.as_mut() else {
            self.eof = true;
            return Poll::Ready(Ok(0));
        };
        match source.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(0))
            }
            Poll::Ready(Some(Ok(chunk))) => {
                self.buf.extend_from_slice(&chunk);
                Poll::Ready(Ok(chunk.len()))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Err(err)),
        }
    }

    /// Drops the source, releasing the underlying connection. Idempotent.
    pub(crate) fn close(&mut self) {
        self.source = None;
    }
}

pub(crate) enum LineStep {
    Line(Vec<u8>),
    NeedMore,
    End,
}

/// Extracts the next newline-terminated line from the buffer, trimmed of
/// surrounding whitespace, CR and trailing commas. Blank heartbeat lines are
/// skipped. At end-of-input an unterminated final line is still returned;
/// `End` means nothing but whitespace remains.
pub(crate) fn next_line(buf: &mut FeedBuffer) -> LineStep {
    loop {
        let data = buf.data();
        let (line_len, consumed) = match data.iter().position(|&b| b == b'\n') {
            Some(i) => (i, i + 1),
            None if buf.eof() => {
                if data.iter().all(u8::is_ascii_whitespace) {
                    return LineStep::End;
                }
                (data.len(), data.len())
            }
            None => return LineStep::NeedMore,
        };
        let line = trim_line(&data[..line_len]).to_vec();
        buf.consume(consumed);
        if line.is_empty() {
            continue;
        }
        return LineStep::Line(line);
    }
}

// CouchDB >= 2.0 terminates rows with "\r\n", and rows inside a feed
// prologue may carry a trailing ','.
fn trim_line(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., last] = line {
        if matches!(*last, b'\r' | b' ' | b'\t' | b',') {
            line = rest;
        } else {
            break;
        }
    }
    while let [first, rest @ ..] = line {
        if first.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// Byte count of leading JSON whitespace.
pub(crate) fn skip_ws(data: &[u8]) -> usize {
    data.iter()
        .take_while(|b| b.is_ascii_whitespace())
        .count()
}

/// Length of the complete JSON value starting at `data[0]`, or `None` if the
/// buffered input ends before the value does.
///
/// Objects and arrays are matched with a nesting depth counter (push on
/// `{`/`[`, pop on `}`/`]`), ignoring delimiter bytes inside string literals
/// and honoring escaped quotes. This is also how unknown keys are skipped:
/// finding a value's extent and consuming it works for any value shape. The
/// caller must strip leading whitespace first.
pub(crate) fn value_extent(data: &[u8], eof: bool) -> Option<usize> {
    match data.first()? {
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (i, &b) in data.iter().enumerate() {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                } else {
                    match b {
                        b'"' => in_string = true,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some(i + 1);
                            }
                        }
                        _ => {}
                    }
                }
            }
            None
        }
        b'"' => string_extent(data),
        // Scalar: runs until a delimiter. At end-of-input the remainder is
        // the whole value.
        _ => match data
            .iter()
            .position(|&b| matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace())
        {
            Some(n) => Some(n),
            None if eof => Some(data.len()),
            None => None,
        },
    }
}

/// Length of the JSON string literal starting at `data[0]`.
pub(crate) fn string_extent(data: &[u8]) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in data.iter().enumerate().skip(1) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Some(i + 1);
        }
    }
    None
}
