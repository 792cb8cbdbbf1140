//! Bounded, replayable event log with optional file persistence.

use crate::events::{type_matches, Event};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Filter applied by [`EventStore::get_events`] and [`EventStore::replay`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Type pattern: literal, `*`, or `prefix.*`.
    pub event_type: Option<String>,
    /// Inclusive lower timestamp bound (epoch milliseconds).
    pub since_ms: Option<u64>,
    /// Exclusive upper timestamp bound (epoch milliseconds).
    pub until_ms: Option<u64>,
    pub user_id: Option<String>,
}

impl EventQuery {
    pub fn event_type(mut self, pattern: impl Into<String>) -> Self {
        self.event_type = Some(pattern.into());
        self
    }

    pub fn since_ms(mut self, since: u64) -> Self {
        self.since_ms = Some(since);
        self
    }

    pub fn until_ms(mut self, until: u64) -> Self {
        self.until_ms = Some(until);
        self
    }

    pub fn user_id(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(pattern) = &self.event_type {
            if !type_matches(pattern, &event.event_type) {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if event.timestamp_ms < since {
                return false;
            }
        }
        if let Some(until) = self.until_ms {
            if event.timestamp_ms >= until {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if event.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Inner {
    events: Vec<Event>,
    /// How many of `events` have already been appended to the file.
    flushed: usize,
}

/// Replayable log of the most recent `max_events` events.
///
/// When file-backed, existing events are loaded at open and `flush` appends
/// the ones stored since the last flush as a JSON-lines stream. The in-memory
/// bound is FIFO; the file keeps the full stream until `clear` truncates it.
pub struct EventStore {
    max_events: usize,
    file_path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl EventStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            file_path: None,
            inner: Mutex::new(Inner { events: Vec::new(), flushed: 0 }),
        }
    }

    /// Open a file-backed store, loading any previously persisted events.
    pub fn with_file(path: impl AsRef<Path>, max_events: usize) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut events = Vec::new();
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping undecodable event line")
                    }
                }
            }
        }
        let max = max_events.max(1);
        if events.len() > max {
            events.drain(..events.len() - max);
        }
        let flushed = events.len();
        Ok(Self {
            max_events: max,
            file_path: Some(path),
            inner: Mutex::new(Inner { events, flushed }),
        })
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Store one event, evicting the oldest when over the bound.
    pub fn store(&self, event: Event) {
        let mut inner = self.lock();
        inner.events.push(event);
        while inner.events.len() > self.max_events {
            inner.events.remove(0);
            inner.flushed = inner.flushed.saturating_sub(1);
        }
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    /// Events matching the query, in insertion order.
    pub fn get_events(&self, query: &EventQuery) -> Vec<Event> {
        self.lock().events.iter().filter(|e| query.matches(e)).cloned().collect()
    }

    /// Replay matching events through `handler` in chronological order,
    /// regardless of the order they were stored in. Returns how many events
    /// were replayed.
    pub async fn replay<F, Fut>(&self, query: &EventQuery, mut handler: F) -> usize
    where
        F: FnMut(Event) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut events = self.get_events(query);
        events.sort_by_key(|e| e.timestamp_ms);
        let count = events.len();
        for event in events {
            handler(event).await;
        }
        count
    }

    /// Append events stored since the last flush to the backing file.
    /// A no-op for in-memory stores.
    pub fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.file_path else { return Ok(()) };
        let mut inner = self.lock();
        if inner.flushed >= inner.events.len() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for event in &inner.events[inner.flushed..] {
            let line = serde_json::to_string(event)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{line}")?;
        }
        file.sync_data()?;
        inner.flushed = inner.events.len();
        Ok(())
    }

    /// Drop every stored event and truncate the backing file.
    pub fn clear(&self) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.events.clear();
        inner.flushed = 0;
        if let Some(path) = &self.file_path {
            if path.exists() {
                std::fs::write(path, b"")?;
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex as StdMutex};

    fn event_at(event_type: &str, timestamp_ms: u64) -> Event {
        let mut event = Event::new(event_type, json!({}));
        event.timestamp_ms = timestamp_ms;
        event
    }

    #[test]
    fn stores_and_counts_events() {
        let store = EventStore::new(100);
        store.store(Event::new("event.a", json!({})));
        store.store(Event::new("event.b", json!({})));
        assert_eq!(store.event_count(), 2);
    }

    #[test]
    fn fifo_eviction_respects_max_events() {
        let store = EventStore::new(3);
        for i in 1..=4 {
            store.store(Event::new(format!("event.{i}"), json!({})));
        }
        assert_eq!(store.event_count(), 3);

        let types: Vec<String> =
            store.get_events(&EventQuery::default()).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["event.2", "event.3", "event.4"]);
    }

    #[test]
    fn queries_filter_by_type_pattern_and_time_window() {
        let store = EventStore::new(100);
        store.store(event_at("message.received", 1000));
        store.store(event_at("message.sent", 2000));
        store.store(event_at("error.occurred", 3000));

        let exact = store.get_events(&EventQuery::default().event_type("message.received"));
        assert_eq!(exact.len(), 1);

        let pattern = store.get_events(&EventQuery::default().event_type("message.*"));
        assert_eq!(pattern.len(), 2);

        let since = store.get_events(&EventQuery::default().since_ms(2000));
        assert_eq!(since.len(), 2);

        let until = store.get_events(&EventQuery::default().until_ms(2000));
        assert_eq!(until.len(), 1);
        assert_eq!(until[0].event_type, "message.received");

        let combined = store
            .get_events(&EventQuery::default().event_type("message.*").since_ms(1500));
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].event_type, "message.sent");
    }

    #[test]
    fn queries_filter_by_user() {
        let store = EventStore::new(100);
        store.store(Event::new("message.sent", json!({})).user_id("u1"));
        store.store(Event::new("message.sent", json!({})).user_id("u2"));

        let events = store.get_events(&EventQuery::default().user_id("u1"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn replay_is_chronological_regardless_of_insertion_order() {
        let store = EventStore::new(100);
        store.store(event_at("event.2", 2000));
        store.store(event_at("event.1", 1000));
        store.store(event_at("event.3", 3000));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let replayed = store
            .replay(&EventQuery::default(), move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(event.event_type);
                }
            })
            .await;

        assert_eq!(replayed, 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["event.1".to_string(), "event.2".to_string(), "event.3".to_string()]
        );
    }

    #[tokio::test]
    async fn replay_honors_the_query() {
        let store = EventStore::new(100);
        store.store(event_at("event.a", 1));
        store.store(event_at("event.b", 2));
        store.store(event_at("event.a", 3));

        let count = store
            .replay(&EventQuery::default().event_type("event.a"), |_event| async {})
            .await;
        assert_eq!(count, 2);
    }

    #[test]
    fn flush_persists_and_reopen_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let store = EventStore::with_file(&path, 100).unwrap();
        store.store(Event::new("bot.started", json!({"v": 1})));
        store.store(Event::new("message.received", json!({"v": 2})));
        store.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("bot.started"));
        assert_eq!(content.lines().count(), 2);

        // Flushing again without new events appends nothing.
        store.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let reopened = EventStore::with_file(&path, 100).unwrap();
        assert_eq!(reopened.event_count(), 2);
        let types: Vec<String> = reopened
            .get_events(&EventQuery::default())
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["bot.started", "message.received"]);
    }

    #[test]
    fn reopen_applies_the_bound_to_loaded_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let store = EventStore::with_file(&path, 100).unwrap();
        for i in 0..5 {
            store.store(Event::new(format!("event.{i}"), json!({})));
        }
        store.flush().unwrap();

        let bounded = EventStore::with_file(&path, 2).unwrap();
        assert_eq!(bounded.event_count(), 2);
        let types: Vec<String> = bounded
            .get_events(&EventQuery::default())
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["event.3", "event.4"]);
    }

    #[test]
    fn clear_truncates_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let store = EventStore::with_file(&path, 100).unwrap();
        store.store(Event::new("event.a", json!({})));
        store.flush().unwrap();
        store.clear().unwrap();

        assert_eq!(store.event_count(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
