use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;
use log::error;

use crate::feed::{self, ByteSource, FeedBuffer, LineStep};
use crate::{DbUpdateEvent, Error};

/// Iterator over the server-wide `_db_updates` feed.
///
/// Receives one [`DbUpdateEvent`] whenever any database is created, updated
/// or deleted. The feed is always continuous: newline-delimited rows until
/// the connection closes, which ends the feed cleanly. A decode failure
/// yields one `Err` item and ends the feed.
pub struct DbUpdatesFeed {
    buf: FeedBuffer,
    ended: bool,
}

impl DbUpdatesFeed {
    /// Wraps an already-open `_db_updates` response body.
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self::opened(Box::pin(source))
    }

    pub(crate) fn opened(source: ByteSource) -> Self {
        DbUpdatesFeed {
            buf: FeedBuffer::new(source),
            ended: false,
        }
    }

    /// Terminates the connection of the feed. Idempotent.
    pub fn close(&mut self) {
        self.ended = true;
        self.buf.close();
    }
}

impl Stream for DbUpdatesFeed {
    type Item = Result<DbUpdateEvent, Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.ended {
                return Poll::Ready(None);
            }
            match feed::next_line(&mut this.buf) {
                LineStep::Line(line) => {
                    return match serde_json::from_slice::<DbUpdateEvent>(&line) {
                        Ok(event) => Poll::Ready(Some(Ok(event))),
                        Err(error) => {
                            this.close();
                            Poll::Ready(Some(Err(Error::ParsingFailed {
                                error,
                                json: String::from_utf8_lossy(&line).into_owned(),
                            })))
                        }
                    };
                }
                LineStep::End => {
                    this.close();
                    return Poll::Ready(None);
                }
                LineStep::NeedMore => match this.buf.poll_fill(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(_)) => {}
                    Poll::Ready(Err(err)) => {
                        error!("error reading _db_updates feed body: {err}");
                        this.close();
                        return Poll::Ready(Some(Err(err)));
                    }
                },
            }
        }
    }
}
