use crate::hub::{BroadcastHub, HubEvent};
use crate::transport::BusTransport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted; only an explicit reconnect request leaves this state.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub state: LinkState,
    pub retry_count: u32,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Exhausted,
    Cancelled,
}

/// Owns the link state machine and the retry counter.
pub struct ReconnectionSupervisor {
    max_retries: u32,
    retry_delay: Duration,
    retry_count: u32,
    status_tx: watch::Sender<LinkStatus>,
    hub: Arc<BroadcastHub>,
}

impl ReconnectionSupervisor {
    pub fn new(
        max_retries: u32,
        retry_delay: Duration,
        hub: Arc<BroadcastHub>,
    ) -> (Self, watch::Receiver<LinkStatus>) {
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let supervisor = Self {
            max_retries,
            retry_delay,
            retry_count: 0,
            status_tx,
            hub,
        };
        (supervisor, status_rx)
    }

    /// Tries to connect until it succeeds, retries run out, or `cancel` fires.
    ///
    /// Each failed attempt publishes one `modbus_status` event. The attempt
    /// that reaches the retry limit moves straight to `Disabled`.
    pub async fn establish<B>(&mut self, bus: &mut B, cancel: &CancellationToken) -> ConnectOutcome
    where
        B: BusTransport + ?Sized,
    {
        loop {
            if cancel.is_cancelled() {
                return ConnectOutcome::Cancelled;
            }
            self.set_state(LinkState::Connecting);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return ConnectOutcome::Cancelled,
                result = bus.connect() => result,
            };

            match attempt {
                Ok(()) => {
                    self.retry_count = 0;
                    self.set_state(LinkState::Connected);
                    info!(endpoint = %bus.describe(), "Modbus connected");
                    self.hub
                        .publish(&HubEvent::modbus_status(true, "Modbus connected successfully"));
                    return ConnectOutcome::Connected;
                }
                Err(e) => {
                    self.retry_count += 1;
                    warn!(
                        attempt = self.retry_count,
                        max_retries = self.max_retries,
                        error = %e,
                        "Modbus connect failed"
                    );
                    self.hub.publish(&HubEvent::modbus_status(
                        false,
                        format!(
                            "Modbus disconnected. Retry attempt {}/{}",
                            self.retry_count, self.max_retries
                        ),
                    ));

                    if self.retry_count >= self.max_retries {
                        self.mark_disabled();
                        return ConnectOutcome::Exhausted;
                    }
                    self.set_state(LinkState::Disconnected);

                    tokio::select! {
                        _ = cancel.cancelled() => return ConnectOutcome::Cancelled,
                        _ = sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    /// A read reported the link gone while connected.
    pub fn link_lost(&mut self) {
        self.set_state(LinkState::Disconnected);
        warn!("Modbus connection lost");
        self.hub
            .publish(&HubEvent::modbus_status(false, "Modbus connection lost"));
    }

    /// Publishes no hub event. The failed attempt that reached the limit
    /// already sent one, so `max_retries` failures yield `max_retries` events.
    pub fn mark_disabled(&mut self) {
        self.set_state(LinkState::Disabled);
        error!(
            retries = self.retry_count,
            "Max reconnection attempts reached, acquisition disabled until a reconnect is requested"
        );
    }

    /// Leaves `Disabled` with a fresh retry budget.
    pub fn rearm(&mut self) {
        self.retry_count = 0;
        self.set_state(LinkState::Disconnected);
        info!("Reconnect requested, retry counter reset");
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_tx.borrow()
    }

    // Only connect results and link loss reach the hub; `Connecting` and
    // `rearm` are visible on the watch channel alone.
    fn set_state(&self, state: LinkState) {
        self.status_tx.send_replace(LinkStatus {
            state,
            retry_count: self.retry_count,
        });
    }
}
