use futures_util::TryStreamExt;
use log::debug;
use serde_json::Value;
use url::Url;

use crate::feed::ByteSource;
use crate::{ChangesFeed, DbUpdatesFeed, Error, Options};

/// Handle to a CouchDB server.
///
/// The client only opens feeds; document operations are not part of this
/// crate. Authentication, proxies and timeouts are configured on the
/// injected [`reqwest::Client`].
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    /// Creates a client for the server at `url`.
    pub fn new(url: &str) -> Result<Self, Error> {
        Self::with_http(reqwest::Client::new(), url)
    }

    /// Creates a client that issues its requests through `http`.
    pub fn with_http(http: reqwest::Client, url: &str) -> Result<Self, Error> {
        let mut base = Url::parse(url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Client { http, base })
    }

    /// Returns a handle to the database `name`.
    pub fn db(&self, name: &str) -> Database {
        Database {
            client: self.clone(),
            name: name.to_string(),
        }
    }

    /// Opens the server-wide `_db_updates` feed. The "feed" option is always
    /// set to "continuous".
    ///
    /// <http://docs.couchdb.org/en/latest/api/server/common.html#db-updates>
    pub async fn db_updates(&self, options: Options) -> Result<DbUpdatesFeed, Error> {
        let options = options.set("feed", "continuous");
        let url = self.feed_url(&["_db_updates"], &options)?;
        let source = self.get_stream(url).await?;
        Ok(DbUpdatesFeed::opened(source))
    }

    fn feed_url(&self, segments: &[&str], options: &Options) -> Result<Url, Error> {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !options.is_empty() {
            url.set_query(Some(&options.encode(&[])?));
        }
        Ok(url)
    }

    async fn get_stream(&self, url: Url) -> Result<ByteSource, Error> {
        debug!("GET {url}");
        let res = self.http.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::InvalidResponse { status, body });
        }
        Ok(Box::pin(res.bytes_stream().map_err(Error::from)))
    }
}

/// Handle to one database on a server.
#[derive(Clone)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens the `_changes` feed of the database.
    ///
    /// The "feed" option selects the framing. The default mode is "normal",
    /// which delivers the changes accumulated so far and then ends the feed;
    /// "longpoll" behaves the same on the wire. Set it to "continuous" for a
    /// feed that stays open until closed:
    ///
    /// ```no_run
    /// # use couch_feeds::{Client, Options};
    /// # async fn open() -> Result<(), couch_feeds::Error> {
    /// let client = Client::new("http://127.0.0.1:5984/")?;
    /// let feed = client
    ///     .db("db")
    ///     .changes(Options::new().set("feed", "continuous"))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// All other options are passed through to the server:
    /// <http://docs.couchdb.org/en/latest/api/database/changes.html>
    pub async fn changes(&self, options: Options) -> Result<ChangesFeed, Error> {
        let continuous = match options.get("feed") {
            None => false,
            Some(Value::String(mode)) => match mode.as_str() {
                "normal" | "longpoll" => false,
                "continuous" => true,
                other => return Err(Error::UnsupportedFeed(other.to_string())),
            },
            Some(other) => return Err(Error::UnsupportedFeed(other.to_string())),
        };
        let url = self.client.feed_url(&[&self.name, "_changes"], &options)?;
        let label = feed_label(url.host_str(), &self.name);
        let source = self.client.get_stream(url).await?;
        Ok(ChangesFeed::opened(source, continuous, &label))
    }
}

// Metrics label for a feed: host and database joined with '_', runs of
// '_' and '/' collapsed.
fn feed_label(host: Option<&str>, db: &str) -> String {
    let raw = format!("{}_{}", host.unwrap_or_default(), db);
    let mut label = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '/' || c == '_' {
            if !label.ends_with('_') {
                label.push('_');
            }
        } else {
            label.push(c);
        }
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_url_escapes_segments_and_sorts_options() {
        let client = Client::new("http://127.0.0.1:5984").unwrap();
        let options = Options::new().set("include_docs", true).set("feed", "continuous");
        let url = client.feed_url(&["a/b", "_changes"], &options).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:5984/a%2Fb/_changes?feed=continuous&include_docs=true"
        );
    }

    #[test]
    fn feed_url_without_options_has_no_query() {
        let client = Client::new("http://127.0.0.1:5984/prefix").unwrap();
        let url = client.feed_url(&["_db_updates"], &Options::new()).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5984/prefix/_db_updates");
    }

    #[tokio::test]
    async fn changes_rejects_unknown_feed_mode() {
        let client = Client::new("http://127.0.0.1:5984/").unwrap();
        let result = client
            .db("db")
            .changes(Options::new().set("feed", "eventsource"))
            .await;
        match result {
            Err(Error::UnsupportedFeed(mode)) => assert_eq!(mode, "eventsource"),
            Err(other) => panic!("expected UnsupportedFeed, got {other:?}"),
            Ok(_) => panic!("expected UnsupportedFeed, got a feed"),
        }
    }

    #[tokio::test]
    async fn changes_rejects_non_string_feed_mode() {
        let client = Client::new("http://127.0.0.1:5984/").unwrap();
        let result = client.db("db").changes(Options::new().set("feed", true)).await;
        assert!(matches!(result, Err(Error::UnsupportedFeed(_))));
    }

    #[test]
    fn feed_label_collapses_separators() {
        assert_eq!(feed_label(Some("couch.local"), "my_db"), "couch.local_my_db");
        assert_eq!(feed_label(Some("h"), "a/_b"), "h_a_b");
        assert_eq!(feed_label(None, "db"), "_db");
    }
}
