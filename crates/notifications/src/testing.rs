//! In-process email gateway for tests

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::email::{EmailGateway, OutgoingEmail};
use crate::error::{NotificationError, NotificationResult};

#[derive(Default)]
struct FakeState {
    sent: Vec<OutgoingEmail>,
    attempts: usize,
    fail_next: Option<NotificationError>,
}

/// Records every message instead of sending it
#[derive(Default)]
pub struct FakeEmailGateway {
    state: Mutex<FakeState>,
}

impl FakeEmailGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages accepted so far, in order
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.state().sent.clone()
    }

    /// Sends attempted, including failed ones
    pub fn attempts(&self) -> usize {
        self.state().attempts
    }

    pub fn fail_next(&self, err: NotificationError) {
        self.state().fail_next = Some(err);
    }
}

#[async_trait]
impl EmailGateway for FakeEmailGateway {
    async fn send(&self, email: &OutgoingEmail) -> NotificationResult<String> {
        let mut state = self.state();
        state.attempts += 1;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.sent.push(email.clone());
        Ok(format!("msg_{:06}", state.sent.len()))
    }
}
