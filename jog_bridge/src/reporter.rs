use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace};

use crate::channel::CommandChannel;
use crate::machine::MachineInterface;
use crate::models::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Sent(Position),
    /// The machine did not produce a usable position (sentinel, error or
    /// timeout).
    Unknown,
    NotConnected,
    WriteFailed,
}

/// Streams the machine position to the client while the command channel is
/// connected.
pub struct PositionReporter {
    machine: Arc<dyn MachineInterface>,
    channel: Arc<CommandChannel>,
    poll_timeout: Duration,
    requested: Notify,
}

impl PositionReporter {
    pub fn new(
        machine: Arc<dyn MachineInterface>,
        channel: Arc<CommandChannel>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            machine,
            channel,
            poll_timeout,
            requested: Notify::new(),
        }
    }

    /// Asks the running reporter for an extra report without waiting for it.
    pub fn request_report(&self) {
        self.requested.notify_one();
    }

    async fn poll_position(&self) -> Option<Position> {
        match tokio::time::timeout(self.poll_timeout, self.machine.read_position()).await {
            Ok(Ok(position)) if position.is_known() => Some(position),
            Ok(Ok(position)) => {
                trace!("Position not yet known: {:?}", position);
                None
            }
            Ok(Err(e)) => {
                trace!("Position read failed: {}", e);
                None
            }
            Err(_) => {
                trace!("Position read timed out after {:?}", self.poll_timeout);
                None
            }
        }
    }

    pub async fn report_once(&self) -> ReportOutcome {
        if !self.channel.is_connected() {
            return ReportOutcome::NotConnected;
        }

        let Some(position) = self.poll_position().await else {
            return ReportOutcome::Unknown;
        };

        match self.channel.write_line(&position.report_line()).await {
            Ok(()) => ReportOutcome::Sent(position),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => ReportOutcome::NotConnected,
            Err(e) => {
                debug!("Failed to write position report: {}", e);
                ReportOutcome::WriteFailed
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("Position reporting started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.requested.notified() => {}
            }
            self.report_once().await;
        }
    }
}
