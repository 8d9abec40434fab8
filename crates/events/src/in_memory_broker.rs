//! In-memory broker for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::broker::{Broker, BrokerError, BrokerMessage};

#[derive(Debug, Default)]
struct State {
    published: Vec<BrokerMessage>,
    fail_next: u32,
    unavailable: bool,
    attempts: u64,
}

/// In-memory broker.
///
/// - No IO
/// - Keeps every acknowledged message, in publish order
/// - Can be told to fail, to simulate an unreachable broker
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes with [`BrokerError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Fail every publish until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Acknowledged messages, oldest first.
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.lock().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.lock().published.len()
    }

    /// Publish calls, successful or not.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.attempts += 1;

        if state.unavailable {
            return Err(BrokerError::Unavailable("broker marked unavailable".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BrokerError::Unavailable("simulated outage".to_string()));
        }

        state.published.push(message);
        Ok(())
    }
}
