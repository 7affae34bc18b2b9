//! A binary, idempotent wake primitive.
//!
//! The original driver posts a named semaphore and guards the post with
//! `if (count < 1) sem_post(...)` to deduplicate wake-ups. `§9` flags that as
//! fragile since it reads semaphore internals; [`Event`] replaces it with a
//! "notify once, stays armed until observed" cell built on [`tokio::sync::Notify`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Event {
    armed: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Arms the event. Safe to call repeatedly before a waiter ever arrives;
    /// only one `wait` is released per arm.
    pub fn post(&self) {
        if !self.armed.swap(true, Ordering::Release) {
            self.notify.notify_one();
        }
    }

    /// Waits until the event is armed, then disarms it.
    pub async fn wait(&self) {
        loop {
            if self.armed.swap(false, Ordering::Acquire) {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Waits as in [`Self::wait`], bounded by `timeout`. `None` waits
    /// indefinitely. Returns `true` if the event fired before the deadline.
    pub async fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => {
                self.wait().await;
                true
            }
            Some(dur) => tokio::time::timeout(dur, self.wait()).await.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn post_before_wait_is_not_lost() {
        let event = Arc::new(Event::new());
        event.post();
        event.wait().await;
    }

    #[tokio::test]
    async fn redundant_posts_wake_only_once() {
        let event = Arc::new(Event::new());
        event.post();
        event.post();
        event.post();
        event.wait().await;
        assert!(!event.wait_timeout(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn waiter_wakes_on_later_post() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move {
                event.wait().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        event.post();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_expires_without_a_post() {
        let event = Event::new();
        assert!(!event.wait_timeout(Some(Duration::from_millis(5))).await);
    }
}
