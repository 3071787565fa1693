use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;
use log::error;
use serde_derive::Deserialize;

use crate::feed::{self, ByteSource, FeedBuffer, LineStep};
use crate::{ChangeEvent, Error, Event, FinishedEvent, Seq};

/// Iterator over the `_changes` feed of a database.
///
/// Yields one [`Event::Change`] per feed row. Poll-style feeds always end
/// with one [`Event::Finished`] built from the trailing `last_seq` and
/// `pending` keys; continuous feeds end with one only if the server sends
/// its terminal row before closing the connection.
///
/// A decode failure yields one `Err` item and ends the feed; after any end
/// the stream keeps returning `None`. Each call decodes at most one row
/// directly off the connection, so the server is throttled by how fast the
/// consumer polls. Dropping the feed, or calling [`close`](Self::close),
/// releases the connection and abandons undelivered events.
///
/// The feed is not meant to be polled from more than one task at a time.
pub struct ChangesFeed {
    buf: FeedBuffer,
    mode: Mode,
    ended: bool,
    #[cfg(feature = "metrics")]
    bytes: metrics::Counter,
    #[cfg(feature = "metrics")]
    entries: metrics::Counter,
}

enum Mode {
    Continuous,
    Poll(PollState),
}

enum PollState {
    /// Waiting for `{"results": [`.
    Preamble,
    /// Inside the results array.
    Rows,
    /// Past the array, collecting trailing top-level keys.
    Trailer(FinishedEvent),
}

enum Step {
    Event(Event),
    Finished(FinishedEvent),
    End,
    NeedMore,
}

impl ChangesFeed {
    /// Wraps an already-open continuous-mode response body. The stream must
    /// carry newline-delimited feed rows.
    pub fn continuous<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self::opened(Box::pin(source), true, "stream")
    }

    /// Wraps an already-open poll-style (`normal` or `longpoll`) response
    /// body. The stream must carry a single `{"results": [...], ...}` object.
    pub fn polled<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self::opened(Box::pin(source), false, "stream")
    }

    pub(crate) fn opened(source: ByteSource, continuous: bool, label: &str) -> Self {
        #[cfg(not(feature = "metrics"))]
        let _ = label;
        #[cfg(feature = "metrics")]
        let (bytes, entries) = {
            let bytes_name = "couchdb_changes_bytes_total";
            let entries_name = "couchdb_changes_entries_total";
            metrics::describe_counter!(bytes_name, metrics::Unit::Bytes, "Changes feed bytes");
            metrics::describe_counter!(
                entries_name,
                metrics::Unit::Count,
                "Changes feed entries"
            );
            (
                metrics::counter!(bytes_name, "database" => label.to_string()),
                metrics::counter!(entries_name, "database" => label.to_string()),
            )
        };

        ChangesFeed {
            buf: FeedBuffer::new(source),
            mode: if continuous {
                Mode::Continuous
            } else {
                Mode::Poll(PollState::Preamble)
            },
            ended: false,
            #[cfg(feature = "metrics")]
            bytes,
            #[cfg(feature = "metrics")]
            entries,
        }
    }

    /// Terminates the connection of the feed. Closing is idempotent and safe
    /// before the feed is exhausted; releasing the connection cannot fail.
    pub fn close(&mut self) {
        self.ended = true;
        self.buf.close();
    }
}

impl Stream for ChangesFeed {
    type Item = Result<Event, Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.ended {
                return Poll::Ready(None);
            }
            let step = match &mut this.mode {
                Mode::Continuous => continuous_step(&mut this.buf),
                Mode::Poll(state) => poll_step(&mut this.buf, state),
            };
            match step {
                Ok(Step::Event(event)) => {
                    #[cfg(feature = "metrics")]
                    this.entries.increment(1);
                    return Poll::Ready(Some(Ok(event)));
                }
                Ok(Step::Finished(fin)) => {
                    this.close();
                    return Poll::Ready(Some(Ok(Event::Finished(fin))));
                }
                Ok(Step::End) => {
                    this.close();
                    return Poll::Ready(None);
                }
                Ok(Step::NeedMore) => match this.buf.poll_fill(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(_n)) => {
                        #[cfg(feature = "metrics")]
                        this.bytes.increment(_n as u64);
                    }
                    Poll::Ready(Err(err)) => {
                        error!("error reading changes feed body: {err}");
                        this.close();
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                Err(err) => {
                    this.close();
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

/// Continuous-mode terminal row: `{"seq": <token>, "last_seq": true}`.
/// Its seq token is the final sequence of the feed.
#[derive(Deserialize)]
struct TerminalRow {
    last_seq: bool,
    #[serde(default)]
    seq: Option<Seq>,
}

fn continuous_step(buf: &mut FeedBuffer) -> Result<Step, Error> {
    match feed::next_line(buf) {
        LineStep::NeedMore => Ok(Step::NeedMore),
        // Connection closed without a terminal row. Some servers do this;
        // it is a clean end, not an error.
        LineStep::End => Ok(Step::End),
        LineStep::Line(line) => decode_row(&line),
    }
}

fn decode_row(line: &[u8]) -> Result<Step, Error> {
    match serde_json::from_slice::<ChangeEvent>(line) {
        Ok(event) => Ok(Step::Event(Event::Change(event))),
        Err(error) => match serde_json::from_slice::<TerminalRow>(line) {
            Ok(row) if row.last_seq => Ok(Step::Finished(FinishedEvent {
                last_seq: row.seq,
                pending: None,
            })),
            _ => Err(parse_error(error, line)),
        },
    }
}

fn poll_step(buf: &mut FeedBuffer, state: &mut PollState) -> Result<Step, Error> {
    loop {
        match state {
            PollState::Preamble => {
                if !consume_preamble(buf)? {
                    return Ok(Step::NeedMore);
                }
                *state = PollState::Rows;
            }
            PollState::Rows => match next_row(buf)? {
                RowStep::Row(event) => return Ok(Step::Event(Event::Change(event))),
                RowStep::EndOfRows => {
                    *state = PollState::Trailer(FinishedEvent {
                        last_seq: None,
                        pending: None,
                    })
                }
                RowStep::NeedMore => return Ok(Step::NeedMore),
            },
            PollState::Trailer(fin) => {
                if trailer_step(buf, fin)? {
                    return Ok(Step::Finished(fin.clone()));
                }
                return Ok(Step::NeedMore);
            }
        }
    }
}

/// Consumes `{ "results" : [` from the buffer. Ok(false) means more input is
/// needed; the buffer is only advanced once the whole preamble is present.
fn consume_preamble(buf: &mut FeedBuffer) -> Result<bool, Error> {
    let data = buf.data();
    let mut pos = feed::skip_ws(data);

    let Some(&open) = data.get(pos) else {
        return incomplete(buf);
    };
    if open != b'{' {
        return Err(unexpected(open, "{"));
    }
    pos += 1;

    pos += feed::skip_ws(&data[pos..]);
    let Some(&quote) = data.get(pos) else {
        return incomplete(buf);
    };
    if quote != b'"' {
        return Err(unexpected(quote, "\"results\""));
    }
    let Some(klen) = feed::string_extent(&data[pos..]) else {
        return incomplete(buf);
    };
    if &data[pos..pos + klen] != br#""results""# {
        return Err(Error::UnexpectedToken {
            found: String::from_utf8_lossy(&data[pos..pos + klen]).into_owned(),
            want: "\"results\"",
        });
    }
    pos += klen;

    pos += feed::skip_ws(&data[pos..]);
    let Some(&colon) = data.get(pos) else {
        return incomplete(buf);
    };
    if colon != b':' {
        return Err(unexpected(colon, ":"));
    }
    pos += 1;

    pos += feed::skip_ws(&data[pos..]);
    let Some(&bracket) = data.get(pos) else {
        return incomplete(buf);
    };
    if bracket != b'[' {
        return Err(unexpected(bracket, "["));
    }
    buf.consume(pos + 1);
    Ok(true)
}

enum RowStep {
    Row(ChangeEvent),
    EndOfRows,
    NeedMore,
}

/// Decodes the next element of the results array, one row per call.
fn next_row(buf: &mut FeedBuffer) -> Result<RowStep, Error> {
    loop {
        let data = buf.data();
        let pos = feed::skip_ws(data);
        let Some(&b) = data.get(pos) else {
            return if buf.eof() {
                Err(Error::UnexpectedEof)
            } else {
                Ok(RowStep::NeedMore)
            };
        };
        match b {
            b',' => buf.consume(pos + 1),
            b']' => {
                buf.consume(pos + 1);
                return Ok(RowStep::EndOfRows);
            }
            _ => {
                let Some(n) = feed::value_extent(&data[pos..], buf.eof()) else {
                    return if buf.eof() {
                        Err(Error::UnexpectedEof)
                    } else {
                        Ok(RowStep::NeedMore)
                    };
                };
                let row = &data[pos..pos + n];
                let event = serde_json::from_slice::<ChangeEvent>(row)
                    .map_err(|error| parse_error(error, row))?;
                buf.consume(pos + n);
                return Ok(RowStep::Row(event));
            }
        }
    }
}

/// Scans the top-level keys after the results array, capturing `last_seq`
/// and `pending` and skipping everything else by value extent, whatever its
/// shape. Ok(true) once the closing `}` has been consumed. Each key/value
/// pair is consumed atomically, so re-entry after more input arrives never
/// lands mid-pair.
fn trailer_step(buf: &mut FeedBuffer, fin: &mut FinishedEvent) -> Result<bool, Error> {
    loop {
        let data = buf.data();
        let pos = feed::skip_ws(data);
        let Some(&b) = data.get(pos) else {
            if buf.eof() {
                return Err(Error::UnexpectedEof);
            }
            return Ok(false);
        };
        match b {
            b',' => {
                buf.consume(pos + 1);
                continue;
            }
            b'}' => {
                buf.consume(pos + 1);
                return Ok(true);
            }
            b'"' => {
                let Some(klen) = feed::string_extent(&data[pos..]) else {
                    return incomplete(buf);
                };
                let mut p = pos + klen;
                p += feed::skip_ws(&data[p..]);
                let Some(&colon) = data.get(p) else {
                    return incomplete(buf);
                };
                if colon != b':' {
                    return Err(unexpected(colon, ":"));
                }
                p += 1;
                p += feed::skip_ws(&data[p..]);
                if data.get(p).is_none() {
                    return incomplete(buf);
                }
                let Some(vlen) = feed::value_extent(&data[p..], buf.eof()) else {
                    return incomplete(buf);
                };

                let key: String = serde_json::from_slice(&data[pos..pos + klen])
                    .map_err(|error| parse_error(error, &data[pos..pos + klen]))?;
                let value = &data[p..p + vlen];
                match key.as_str() {
                    "last_seq" => {
                        fin.last_seq = Some(
                            serde_json::from_slice(value)
                                .map_err(|error| parse_error(error, value))?,
                        )
                    }
                    "pending" => {
                        fin.pending = Some(
                            serde_json::from_slice(value)
                                .map_err(|error| parse_error(error, value))?,
                        )
                    }
                    // Unknown key: the extent scan already spans the whole
                    // value, nested or not, so skipping is just consuming.
                    _ => {}
                }
                buf.consume(p + vlen);
            }
            other => return Err(unexpected(other, "\"<key>\" or }")),
        }
    }
}

fn incomplete(buf: &FeedBuffer) -> Result<bool, Error> {
    if buf.eof() {
        Err(Error::UnexpectedEof)
    } else {
        Ok(false)
    }
}

fn unexpected(found: u8, want: &'static str) -> Error {
    Error::UnexpectedToken {
        found: (found as char).to_string(),
        want,
    }
}

fn parse_error(error: serde_json::Error, json: &[u8]) -> Error {
    Error::ParsingFailed {
        error,
        json: String::from_utf8_lossy(json).into_owned(),
    }
}
