//! Typed in-process event bus with pattern subscriptions and bounded history.

use crate::time::epoch_millis;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Well-known event types emitted by the gateway and its surroundings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ApiCallStarted,
    ApiCallCompleted,
    ErrorOccurred,
    HealthCheckFailed,
    BotStarted,
    BotStopped,
    MessageReceived,
    MessageSent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ApiCallStarted => "api.call.started",
            EventType::ApiCallCompleted => "api.call.completed",
            EventType::ErrorOccurred => "error.occurred",
            EventType::HealthCheckFailed => "health.check.failed",
            EventType::BotStarted => "bot.started",
            EventType::BotStopped => "bot.stopped",
            EventType::MessageReceived => "message.received",
            EventType::MessageSent => "message.sent",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp_ms: u64,
    pub data: Value,
    pub source: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp_ms: epoch_millis(),
            data,
            source: "unknown".into(),
            user_id: None,
            correlation_id: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Check an event type against a subscription pattern: `*` matches anything,
/// `prefix.*` matches the prefix, anything else matches literally.
pub(crate) fn type_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false);
    }
    false
}

type CallbackError = Box<dyn std::error::Error + Send + Sync>;
type Callback = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync>;
type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscription {
    name: String,
    patterns: Vec<String>,
    priority: i32,
    filter: Option<Filter>,
    callback: Callback,
    seq: u64,
}

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Entries kept in the history ring.
    pub max_history: usize,
    /// Cap on events queued while paused; `None` is unbounded.
    pub max_queue: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { max_history: 1000, max_queue: None }
    }
}

struct Inner {
    subscribers: Vec<Subscription>,
    history: VecDeque<Event>,
    paused: bool,
    queue: VecDeque<Event>,
    next_seq: u64,
}

/// In-process publish/subscribe bus.
///
/// Dispatch per event is serial, in priority order (higher first, ties by
/// registration), and happens outside the bus lock so slow subscribers never
/// block publishers on other tasks. A failing subscriber is logged and does
/// not affect the rest.
pub struct EventBus {
    config: BusConfig,
    inner: Mutex<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                history: VecDeque::new(),
                paused: false,
                queue: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Subscribe a named handler to one or more type patterns.
    pub fn subscribe<F, Fut>(&self, name: impl Into<String>, patterns: &[&str], priority: i32, f: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.subscribe_filtered(name, patterns, priority, None::<fn(&Event) -> bool>, f)
    }

    /// Subscribe with a predicate that can reject events before the callback.
    pub fn subscribe_filtered<P, F, Fut>(
        &self,
        name: impl Into<String>,
        patterns: &[&str],
        priority: i32,
        filter: Option<P>,
        f: F,
    ) where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |event| Box::pin(f(event)));
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.subscribers.push(Subscription {
            name: name.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            priority,
            filter: filter.map(|p| Arc::new(p) as Filter),
            callback,
            seq,
        });
    }

    /// Remove a subscriber by name. Returns whether one was removed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.name != name);
        inner.subscribers.len() != before
    }

    /// Publish an event to all matching subscribers, returning how many
    /// callbacks ran. While paused, the event is queued instead.
    pub async fn publish(&self, event: Event) -> usize {
        let matching: Vec<(String, Callback)> = {
            let mut inner = self.lock();

            if inner.paused {
                if let Some(cap) = self.config.max_queue {
                    if inner.queue.len() >= cap {
                        tracing::warn!(
                            event_type = %event.event_type,
                            "event queue full while paused, dropping event"
                        );
                        return 0;
                    }
                }
                inner.queue.push_back(event);
                return 0;
            }

            inner.history.push_back(event.clone());
            while inner.history.len() > self.config.max_history {
                inner.history.pop_front();
            }

            let mut matched: Vec<&Subscription> = inner
                .subscribers
                .iter()
                .filter(|s| s.patterns.iter().any(|p| type_matches(p, &event.event_type)))
                .filter(|s| s.filter.as_ref().map(|f| f(&event)).unwrap_or(true))
                .collect();
            matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            matched
                .into_iter()
                .map(|s| (s.name.clone(), Arc::clone(&s.callback)))
                .collect()
        };

        let mut delivered = 0;
        for (name, callback) in matching {
            match callback(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::error!(subscriber = %name, error = %e, "event handler failed");
                }
            }
        }
        tracing::debug!(event_type = %event.event_type, delivered, "event dispatched");
        delivered
    }

    /// Build and publish an event in one call.
    pub async fn emit(&self, event_type: EventType, data: Value) -> usize {
        self.publish(Event::new(event_type.as_str(), data)).await
    }

    /// Queue publishes instead of dispatching them.
    pub fn pause(&self) {
        self.lock().paused = true;
        tracing::info!("event bus paused");
    }

    /// Resume dispatch, draining queued events through the normal path.
    /// Returns how many events were drained.
    pub async fn resume(&self) -> usize {
        let drained: Vec<Event> = {
            let mut inner = self.lock();
            inner.paused = false;
            inner.queue.drain(..).collect()
        };
        let count = drained.len();
        for event in drained {
            self.publish(event).await;
        }
        tracing::info!(count, "event bus resumed");
        count
    }

    /// Most recent events, oldest first, optionally filtered by type patterns
    /// and user.
    pub fn history(
        &self,
        event_types: Option<&[&str]>,
        user_id: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        let inner = self.lock();
        let filtered: Vec<Event> = inner
            .history
            .iter()
            .filter(|e| match event_types {
                Some(patterns) => patterns.iter().any(|p| type_matches(p, &e.event_type)),
                None => true,
            })
            .filter(|e| match user_id {
                Some(user) => e.user_id.as_deref() == Some(user),
                None => true,
            })
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn queued_events(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
