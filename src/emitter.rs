//! Fans decoded gateway events out to listeners.
//!
//! Listeners for an event are grouped in three stages. A stage's listeners run concurrently and
//! the next stage only starts once every listener of the previous one has finished, so `Before`
//! listeners always see an event first and `After` listeners always see it last.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;

#[async_trait]
pub trait Listener: Send + Sync {
    async fn call(&self, event: &str, data: &Value);
}

/// Adapts an async closure into a [`Listener`]. Used by [`Emitter::on`].
pub struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn call(&self, event: &str, data: &Value) {
        (self.0)(event.to_string(), data.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Before,
    Normal,
    After,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::Before, Priority::Normal, Priority::After];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Stage = Vec<(ListenerId, Arc<dyn Listener>)>;

#[derive(Default)]
struct ListenerPod {
    stages: [Stage; 3],
}

impl ListenerPod {
    fn is_empty(&self) -> bool {
        self.stages.iter().all(Vec::is_empty)
    }
}

#[derive(Default)]
pub struct Emitter {
    listeners: DashMap<String, ListenerPod>,
    next_id: AtomicU64,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &self,
        event: impl Into<String>,
        listener: impl Listener + 'static,
        priority: Priority,
    ) -> ListenerId {
        self.add_shared(event, Arc::new(listener), priority)
    }

    /// Registers the same listener object under another event.
    pub fn add_shared(
        &self,
        event: impl Into<String>,
        listener: Arc<dyn Listener>,
        priority: Priority,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(event.into().to_uppercase())
            .or_default()
            .stages[priority.index()]
            .push((id, listener));
        id
    }

    /// Shorthand for registering an async closure.
    pub fn on<F, Fut>(&self, event: impl Into<String>, priority: Priority, f: F) -> ListenerId
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_listener(event, FnListener(f), priority)
    }

    /// Returns whether a listener was removed.
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        let event = event.to_uppercase();
        let Some(mut pod) = self.listeners.get_mut(&event) else {
            return false;
        };

        let mut removed = false;
        for stage in &mut pod.stages {
            let before = stage.len();
            stage.retain(|(listener, _)| *listener != id);
            removed |= stage.len() != before;
        }

        let empty = pod.is_empty();
        drop(pod);
        if empty {
            self.listeners.remove_if(&event, |_, pod| pod.is_empty());
        }
        removed
    }

    /// Drops every listener of `event`.
    pub fn clear_event(&self, event: &str) {
        self.listeners.remove(&event.to_uppercase());
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listeners
            .get(&event.to_uppercase())
            .is_some_and(|pod| !pod.is_empty())
    }

    pub async fn emit(&self, event: &str, data: Value) {
        let stages = {
            let Some(pod) = self.listeners.get(&event.to_uppercase()) else {
                return;
            };
            Priority::ALL.map(|priority| {
                pod.stages[priority.index()]
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect::<Vec<_>>()
            })
        };

        for stage in stages {
            join_all(stage.iter().map(|listener| listener.call(event, &data))).await;
        }
    }
}
