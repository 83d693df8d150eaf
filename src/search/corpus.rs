//! Corpus sources.
//!
//! A corpus source supplies every message that already has an embedding.
//! The cache manager calls it on refresh and never looks at partial results:
//! a source either returns the whole corpus or an error.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use super::types::EmbeddingEntry;
use crate::error::{Error, Result};

/// Supplies the full set of embedded messages for a refresh.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<EmbeddingEntry>>;
}

/// Corpus held in memory. Useful for embedding the search core in another
/// process that already has the messages, and as a test double.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    state: RwLock<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    entries: Vec<EmbeddingEntry>,
    failure: Option<String>,
    fetches: usize,
}

impl InMemoryCorpus {
    pub fn new(entries: Vec<EmbeddingEntry>) -> Self {
        Self {
            state: RwLock::new(InMemoryState {
                entries,
                ..Default::default()
            }),
        }
    }

    /// Replace the corpus returned by subsequent fetches.
    pub fn set_entries(&self, entries: Vec<EmbeddingEntry>) {
        if let Ok(mut state) = self.state.write() {
            state.entries = entries;
        }
    }

    /// Make subsequent fetches fail with `reason`, or succeed again with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        if let Ok(mut state) = self.state.write() {
            state.failure = reason.map(String::from);
        }
    }

    /// Number of `fetch_all` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.state.read().map(|s| s.fetches).unwrap_or(0)
    }
}

#[async_trait]
impl CorpusSource for InMemoryCorpus {
    async fn fetch_all(&self) -> Result<Vec<EmbeddingEntry>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Corpus("corpus lock poisoned".to_string()))?;
        state.fetches += 1;
        match &state.failure {
            Some(reason) => Err(Error::Corpus(reason.clone())),
            None => Ok(state.entries.clone()),
        }
    }
}

/// Reads a JSON array of [`EmbeddingEntry`] from disk.
#[derive(Debug, Clone)]
pub struct JsonFileCorpus {
    path: PathBuf,
}

impl JsonFileCorpus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CorpusSource for JsonFileCorpus {
    async fn fetch_all(&self) -> Result<Vec<EmbeddingEntry>> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::Corpus(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let entries: Vec<EmbeddingEntry> = serde_json::from_slice(&raw)?;
        debug!(
            "Loaded {} entries from {}",
            entries.len(),
            self.path.display()
        );
        Ok(entries)
    }
}

/// Rows per page requested from the REST endpoint.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Columns selected from the messages table, with channel and author embeds.
const MESSAGE_SELECT: &str =
    "id,message,embedding,inserted_at,channel:channel(slug),user:users(username)";

/// Queries the backend's REST interface for messages with a computed
/// embedding.
#[derive(Debug, Clone)]
pub struct RestCorpusSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
}

impl RestCorpusSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Corpus(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/rest/v1/messages", self.base_url)
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<MessageRow>> {
        let mut request = self.client.get(self.messages_url()).query(&[
            ("select", MESSAGE_SELECT.to_string()),
            ("embedding", "not.is.null".to_string()),
            ("order", "id.asc".to_string()),
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Corpus(format!("corpus request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Corpus(format!(
                "corpus request returned {}: {}",
                status, body
            )));
        }
        response
            .json::<Vec<MessageRow>>()
            .await
            .map_err(|e| Error::Corpus(format!("malformed corpus response: {}", e)))
    }
}

#[async_trait]
impl CorpusSource for RestCorpusSource {
    async fn fetch_all(&self) -> Result<Vec<EmbeddingEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0;
        // The server may cap a page below `page_size` (PostgREST `max-rows`),
        // so only an empty page marks the end.
        loop {
            let rows = self.fetch_page(offset).await?;
            if rows.is_empty() {
                break;
            }
            offset += rows.len();
            for row in rows {
                entries.push(row.into_entry()?);
            }
        }
        info!("Fetched {} embedded messages from backend", entries.len());
        Ok(entries)
    }
}

/// A message row as returned by the REST interface.
#[derive(Debug, Deserialize)]
struct MessageRow {
    id: serde_json::Value,
    message: String,
    embedding: Option<RawVector>,
    #[serde(default)]
    inserted_at: Option<String>,
    #[serde(default)]
    channel: Option<Embedded<ChannelRef>>,
    #[serde(default)]
    user: Option<Embedded<UserRef>>,
}

/// pgvector columns arrive either as a JSON array or as a text literal.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVector {
    Array(Vec<f32>),
    Text(String),
}

/// Embedded relations come back as an object or a one-element array
/// depending on how the relationship is declared.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Embedded<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Embedded<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Embedded::One(v) => Some(v),
            Embedded::Many(v) => v.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelRef {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    username: String,
}

impl MessageRow {
    fn into_entry(self) -> Result<EmbeddingEntry> {
        let id = match self.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let vector = match self.embedding {
            Some(RawVector::Array(v)) => v,
            Some(RawVector::Text(s)) => parse_vector_literal(&s).ok_or_else(|| {
                Error::Corpus(format!("message {} has an unparseable embedding", id))
            })?,
            None => {
                return Err(Error::Corpus(format!("message {} has no embedding", id)));
            }
        };
        let source_timestamp = self
            .inserted_at
            .as_deref()
            .and_then(parse_timestamp_millis)
            .unwrap_or(0);

        let mut entry = EmbeddingEntry::new(id, self.message, vector, source_timestamp);
        entry.channel = self
            .channel
            .and_then(Embedded::into_first)
            .map(|c| c.slug);
        entry.username = self.user.and_then(Embedded::into_first).map(|u| u.username);
        Ok(entry)
    }
}

/// Parse a pgvector text literal such as `[0.1,0.2,0.3]`.
pub fn parse_vector_literal(raw: &str) -> Option<Vec<f32>> {
    let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<f32>().ok())
        .collect()
}

fn parse_timestamp_millis(raw: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
}
