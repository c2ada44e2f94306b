//! Named, individually cancellable timers
//!
//! Each timer is a spawned task that delivers an event into its owner's
//! queue when it fires. Cancelling aborts the task; cancelling a timer that
//! does not exist is a no-op.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

pub struct Timers<E> {
    tx: mpsc::UnboundedSender<E>,
    handles: HashMap<String, JoinHandle<()>>,
}

impl<E: Send + 'static> Timers<E> {
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            handles: HashMap::new(),
        }
    }

    /// Deliver `event` once after `delay`, replacing a timer of the same key.
    pub fn set_timeout(&mut self, key: impl Into<String>, delay: Duration, event: E) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(event);
        });
        self.replace(key.into(), handle);
    }

    /// Deliver `event` every `period`, first after one full period.
    pub fn set_interval(&mut self, key: impl Into<String>, period: Duration, event: E)
    where
        E: Clone,
    {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(event.clone()).is_err() {
                    break;
                }
            }
        });
        self.replace(key.into(), handle);
    }

    pub fn clear_timeout(&mut self, key: &str) {
        if let Some(handle) = self.handles.remove(key) {
            handle.abort();
        }
    }

    pub fn clear_interval(&mut self, key: &str) {
        self.clear_timeout(key);
    }

    /// Consume a one-shot timer that just fired.
    ///
    /// Returns false if it was cleared in the meantime, in which case the
    /// delivered event is stale and must be ignored.
    pub fn take_fired(&mut self, key: &str) -> bool {
        self.handles.remove(key).is_some()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.handles.contains_key(key)
    }

    pub fn clear_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn replace(&mut self, key: String, handle: JoinHandle<()>) {
        if let Some(previous) = self.handles.insert(key, handle) {
            previous.abort();
        }
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}
