//! Debounced view of endpoint state for display

use std::time::Duration;
use tokio::sync::watch;

use super::EndpointState;
use crate::constants::STATE_DEBOUNCE;

/// Yields a state only once it has held steady for the window, so rapid
/// reconnect attempts do not flicker in a status display.
pub struct StateDebouncer {
    rx: watch::Receiver<EndpointState>,
    window: Duration,
    last_emitted: Option<EndpointState>,
}

impl StateDebouncer {
    pub fn new(rx: watch::Receiver<EndpointState>) -> Self {
        Self::with_window(rx, STATE_DEBOUNCE)
    }

    pub fn with_window(rx: watch::Receiver<EndpointState>, window: Duration) -> Self {
        Self {
            rx,
            window,
            last_emitted: None,
        }
    }

    /// Next settled state that differs from the previous one. Returns `None`
    /// once the endpoint is gone.
    pub async fn next(&mut self) -> Option<EndpointState> {
        loop {
            let candidate = *self.rx.borrow_and_update();
            if Some(candidate) == self.last_emitted {
                self.rx.changed().await.ok()?;
                continue;
            }

            match tokio::time::timeout(self.window, self.rx.changed()).await {
                // changed again inside the window: restart with the new value
                Ok(Ok(())) => continue,
                // held steady, or the sender went away leaving this as final
                Err(_) | Ok(Err(_)) => {
                    self.last_emitted = Some(candidate);
                    return Some(candidate);
                }
            }
        }
    }
}
