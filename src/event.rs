use serde_derive::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::Seq;

/// One item of a changes feed.
#[derive(Debug)]
pub enum Event {
    /// A decoded feed row.
    Change(ChangeEvent),
    /// The terminal event, carrying the feed's final sequence token.
    Finished(FinishedEvent),
}

/// A document change notification, as sent in a `_changes` feed row.
#[derive(Serialize, Deserialize, Debug)]
pub struct ChangeEvent {
    /// The update sequence of the event.
    pub seq: Seq,

    /// The id of the changed document.
    pub id: String,

    /// True when the event represents a deleted document. CouchDB omits the
    /// key for non-deleted documents, so this defaults to false on every row.
    #[serde(default)]
    pub deleted: bool,

    /// The document's leaf revisions.
    #[serde(default)]
    pub changes: Vec<Change>,

    /// The document body, raw and undecoded. Populated only when the feed was
    /// opened with the "include_docs" option.
    #[serde(default)]
    pub doc: Option<Box<RawValue>>,
}

impl ChangeEvent {
    /// Returns the revision ids of the row in array order.
    pub fn revs(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.rev.as_str()).collect()
    }
}

/// One leaf revision of a changed document.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Change {
    pub rev: String,
}

/// End of a changes feed.
///
/// Poll-style feeds always produce one of these after the last row, built
/// from the trailing `last_seq` and `pending` keys. Continuous feeds produce
/// one only when the server sends an explicit terminal row; a connection
/// closed without it ends the feed with no `Finished` event.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedEvent {
    /// The sequence token of the last delivered event.
    pub last_seq: Option<Seq>,
    /// Count of further changes not delivered by this feed.
    /// Not sent by CouchDB 1.0 and never sent on continuous feeds.
    pub pending: Option<u64>,
}

/// A database lifecycle notification from the `_db_updates` feed.
#[derive(Serialize, Deserialize, Debug)]
pub struct DbUpdateEvent {
    /// The affected database.
    pub db_name: String,

    #[serde(rename = "type")]
    pub kind: DbEventKind,

    /// The update sequence of the event. Not sent by older servers.
    #[serde(default)]
    pub seq: Option<Seq>,

    /// Operation status flag sent by servers too old to send a seq.
    /// Deprecated upstream.
    #[serde(default)]
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbEventKind {
    Created,
    Updated,
    Deleted,
}
