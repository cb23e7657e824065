use crate::hub::BroadcastHub;
use crate::orchestrator::PollOrchestrator;
use crate::poll::PollTiming;
use crate::register_map::RegisterMapRegistry;
use crate::sink::PersistenceSink;
use crate::supervisor::{ConnectOutcome, LinkState, LinkStatus, ReconnectionSupervisor};
use crate::transport::BusTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub poll_interval: Duration,
    pub timing: PollTiming,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            timing: PollTiming::default(),
            max_retries: 5,
            retry_delay: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug)]
enum Command {
    Reconnect,
}

/// Cloneable view onto a running acquisition task.
#[derive(Debug, Clone)]
pub struct AcquisitionControl {
    status_rx: watch::Receiver<LinkStatus>,
    commands: mpsc::Sender<Command>,
}

impl AcquisitionControl {
    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Asks a disabled acquisition to start connecting again.
    pub fn request_reconnect(&self) -> ReconnectRequest {
        if self.commands.is_closed() {
            return ReconnectRequest::Stopped;
        }
        let state = self.status().state;
        if state != LinkState::Disabled {
            return ReconnectRequest::NotDisabled(state);
        }
        match self.commands.try_send(Command::Reconnect) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => ReconnectRequest::Accepted,
            Err(mpsc::error::TrySendError::Closed(_)) => ReconnectRequest::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectRequest {
    Accepted,
    /// Only a disabled link can be re-armed.
    NotDisabled(LinkState),
    /// The acquisition task has exited.
    Stopped,
}

pub struct AcquisitionHandle {
    control: AcquisitionControl,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AcquisitionHandle {
    pub fn control(&self) -> AcquisitionControl {
        self.control.clone()
    }

    pub fn status(&self) -> LinkStatus {
        self.control.status()
    }

    pub fn request_reconnect(&self) -> ReconnectRequest {
        self.control.request_reconnect()
    }

    /// Stops acquisition after the in-flight tick and closes the bus.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Acquisition task ended abnormally");
        }
    }
}

/// The single task that owns the bus.
pub struct Acquisition<B, S: ?Sized> {
    bus: B,
    orchestrator: PollOrchestrator<S>,
    supervisor: ReconnectionSupervisor,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl<B, S> Acquisition<B, S>
where
    B: BusTransport + 'static,
    S: PersistenceSink + ?Sized + 'static,
{
    pub fn spawn(
        bus: B,
        registry: RegisterMapRegistry,
        sink: Arc<S>,
        hub: Arc<BroadcastHub>,
        config: AcquisitionConfig,
    ) -> AcquisitionHandle {
        let (supervisor, status_rx) =
            ReconnectionSupervisor::new(config.max_retries, config.retry_delay, hub.clone());
        let (command_tx, command_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let acquisition = Self {
            bus,
            orchestrator: PollOrchestrator::new(registry, config.timing, sink, hub),
            supervisor,
            commands: command_rx,
            cancel: cancel.clone(),
            poll_interval: config.poll_interval,
            retry_delay: config.retry_delay,
        };
        let task = tokio::spawn(acquisition.run());

        AcquisitionHandle {
            control: AcquisitionControl {
                status_rx,
                commands: command_tx,
            },
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        info!(
            endpoint = %self.bus.describe(),
            devices = self.orchestrator.registry().len(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Acquisition started"
        );

        loop {
            match self.supervisor.establish(&mut self.bus, &self.cancel).await {
                ConnectOutcome::Connected => {}
                ConnectOutcome::Cancelled => break,
                ConnectOutcome::Exhausted => {
                    if self.wait_for_reconnect().await {
                        continue;
                    }
                    break;
                }
            }

            if !self.poll_while_connected().await {
                break;
            }
            self.bus.disconnect().await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.retry_delay) => {}
            }
        }

        self.bus.disconnect().await;
        info!("Acquisition stopped");
    }

    /// Ticks until the link is lost (returns true) or shutdown (false).
    async fn poll_while_connected(&mut self) -> bool {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut first_deadline = None;

        loop {
            let deadline = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                at = ticker.tick() => at,
            };
            let origin = *first_deadline.get_or_insert(deadline);

            let outcome = self.orchestrator.run_tick(&mut self.bus).await;
            if outcome.link_lost {
                self.supervisor.link_lost();
                return true;
            }
            if self.cancel.is_cancelled() {
                return false;
            }

            // deadlines that passed while this tick ran are dropped, not queued
            let now = Instant::now();
            if now > deadline + self.poll_interval {
                let next = next_boundary(origin, self.poll_interval, now);
                debug!(
                    overrun_ms = (now - deadline).as_millis() as u64,
                    "Poll tick overran the interval, skipping missed ticks"
                );
                ticker.reset_at(next);
            }
        }
    }

    /// Parks a disabled acquisition until someone asks for a reconnect.
    async fn wait_for_reconnect(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            command = self.commands.recv() => match command {
                Some(Command::Reconnect) => {
                    // repeated requests must not re-arm a later Disabled period
                    while self.commands.try_recv().is_ok() {}
                    self.supervisor.rearm();
                    true
                }
                None => {
                    self.cancel.cancelled().await;
                    false
                }
            },
        }
    }
}

/// First multiple of `period` after `origin` that lies strictly after `now`.
fn next_boundary(origin: Instant, period: Duration, now: Instant) -> Instant {
    let period_nanos = period.as_nanos().max(1);
    let elapsed = now.saturating_duration_since(origin).as_nanos();
    let periods = u32::try_from(elapsed / period_nanos + 1).unwrap_or(u32::MAX);
    origin + period * periods
}
