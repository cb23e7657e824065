use crate::hub::{BroadcastHub, HubEvent};
use crate::poll::{poll_device, PollTiming};
use crate::register_map::RegisterMapRegistry;
use crate::sink::PersistenceSink;
use crate::transport::BusTransport;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    /// Devices whose poll cycle ran, including failed ones.
    pub polled: usize,
    pub succeeded: usize,
    /// A link-level failure cut the tick short.
    pub link_lost: bool,
}

/// Runs one poll pass over every configured meter, in configured order.
pub struct PollOrchestrator<S: ?Sized> {
    registry: RegisterMapRegistry,
    timing: PollTiming,
    sink: Arc<S>,
    hub: Arc<BroadcastHub>,
}

impl<S> PollOrchestrator<S>
where
    S: PersistenceSink + ?Sized,
{
    pub fn new(
        registry: RegisterMapRegistry,
        timing: PollTiming,
        sink: Arc<S>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            registry,
            timing,
            sink,
            hub,
        }
    }

    pub fn registry(&self) -> &RegisterMapRegistry {
        &self.registry
    }

    pub async fn run_tick<B>(&self, bus: &mut B) -> TickOutcome
    where
        B: BusTransport + ?Sized,
    {
        let mut outcome = TickOutcome::default();

        for (index, map) in self.registry.devices().iter().enumerate() {
            if index > 0 && !self.timing.inter_device_delay.is_zero() {
                sleep(self.timing.inter_device_delay).await;
            }

            let sample = poll_device(bus, map, &self.timing).await;
            outcome.polled += 1;

            if sample.success {
                outcome.succeeded += 1;
                if let Err(e) = self
                    .sink
                    .save(&sample.device_id, &sample.fields, Some(sample.timestamp))
                    .await
                {
                    error!(device_id = %sample.device_id, error = %e, "Failed to persist reading");
                }
            } else {
                warn!(
                    device_id = %sample.device_id,
                    error = sample.error_message.as_deref().unwrap_or("unknown"),
                    "Device poll failed"
                );
            }

            let link_lost = sample.is_link_failure();
            self.hub.publish(&HubEvent::EnergyReading(sample));

            if link_lost {
                outcome.link_lost = true;
                break;
            }
        }

        debug!(
            polled = outcome.polled,
            succeeded = outcome.succeeded,
            link_lost = outcome.link_lost,
            "Tick finished"
        );
        outcome
    }
}
