//! Streaming client for CouchDB change notification feeds.
//!
//! The crate covers two feeds of the CouchDB HTTP API: the per-database
//! `_changes` feed and the server-wide `_db_updates` feed. Both are exposed
//! as a `futures::Stream` of decoded events over the open response body.
//! Continuous feeds are decoded row by row as the server writes them; poll
//! style responses are decoded incrementally too, one result row per poll,
//! so a large response is never buffered whole.
//!
//! ```no_run
//! use couch_feeds::{Client, Event, Options};
//! use futures_util::stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), couch_feeds::Error> {
//!     let client = Client::new("http://127.0.0.1:5984/")?;
//!     let mut feed = client
//!         .db("db")
//!         .changes(Options::new().set("feed", "continuous"))
//!         .await?;
//!     while let Some(event) = feed.next().await {
//!         match event? {
//!             Event::Change(change) => println!("changed ({}): {}", change.seq, change.id),
//!             Event::Finished(fin) => println!("finished: {:?}", fin.last_seq),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! A feed that ends without yielding an `Err` item ended cleanly; servers
//! are allowed to close a continuous connection without a terminal row.
//! Sequence tokens are opaque: depending on the server version they arrive
//! as numbers or strings, and [`Seq`] preserves whichever type was sent.

mod changes;
mod client;
mod db_updates;
mod error;
mod event;
mod feed;
mod options;
mod seq;

pub use changes::ChangesFeed;
pub use client::{Client, Database};
pub use db_updates::DbUpdatesFeed;
pub use error::Error;
pub use event::{Change, ChangeEvent, DbEventKind, DbUpdateEvent, Event, FinishedEvent};
pub use options::Options;
pub use seq::Seq;
