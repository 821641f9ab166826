use std::sync::Arc;

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};
use utilities::line_framer::LineFramer;

use crate::channel::CommandChannel;
use crate::config::BridgeConfig;
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::machine::MachineInterface;
use crate::reporter::PositionReporter;

/// What happened during one command-channel session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub bytes_read: usize,
    pub lines: usize,
    pub ignored: usize,
    pub busy: usize,
    pub failed: usize,
    pub oversized: usize,
}

impl SessionSummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.lines += 1;
        match outcome {
            DispatchOutcome::Ignored => self.ignored += 1,
            DispatchOutcome::Busy => self.busy += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Completed => {}
        }
    }
}

/// Owns the command-channel lifecycle and the machine it drives.
pub struct ConnectionManager {
    config: BridgeConfig,
    machine: Arc<dyn MachineInterface>,
}

impl ConnectionManager {
    pub fn new(config: BridgeConfig, machine: Arc<dyn MachineInterface>) -> Self {
        Self { config, machine }
    }

    /// Connects to the client and serves sessions until the client goes away
    /// for good.
    #[instrument(skip(self), fields(address = %self.config.command_channel.address()))]
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let stream = self.connect().await?;
            let summary = self.run_session(stream).await;
            info!("Session finished: {:?}", summary);

            if !self.config.command_channel.reconnect {
                return Ok(());
            }
            info!("Reconnecting to client");
        }
    }

    pub async fn connect(&self) -> anyhow::Result<TcpStream> {
        let channel = &self.config.command_channel;
        let address = channel.address();
        let attempts = channel.connect_retries.max(1);

        for attempt in 1..=attempts {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    info!("Connected to client at {}", address);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt, attempts, address, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(channel.retry_delay()).await;
                    }
                }
            }
        }

        Err(anyhow!(
            "Failed to connect to {} after {} attempts",
            address,
            attempts
        ))
    }

    /// Serves one connected stream until EOF or a read error.
    ///
    /// The machine is shut down exactly once when the session ends, whatever
    /// state start-up had reached.
    #[instrument(skip_all)]
    pub async fn run_session<S>(&self, stream: S) -> SessionSummary
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel_config = &self.config.command_channel;
        let reporting = &self.config.reporting;
        let mut summary = SessionSummary::default();

        let (mut reader, writer) = tokio::io::split(stream);
        let channel = Arc::new(CommandChannel::with_write_timeout(
            channel_config.write_timeout(),
        ));
        channel.attach(Box::new(writer)).await;

        let reporter = Arc::new(PositionReporter::new(
            self.machine.clone(),
            channel.clone(),
            reporting.poll_timeout(),
        ));
        let dispatcher = CommandDispatcher::new(
            self.machine.clone(),
            reporter.clone(),
            self.config.file_channel.clone(),
        );

        let greeted = match channel.write_line(&channel_config.greeting).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send greeting: {}", e);
                false
            }
        };

        let startup = {
            let machine = self.machine.clone();
            let reporter = reporter.clone();
            let interval = reporting.poll_interval();
            tokio::spawn(async move {
                match machine.initialize().await {
                    Ok(()) => info!("Machine initialized"),
                    Err(e) => error!("Machine initialization failed: {}", e),
                }
                reporter.run(interval).await;
            })
        };

        if greeted {
            let mut framer = LineFramer::new(channel_config.max_line_length);
            let mut buf = vec![0u8; channel_config.read_buffer_size];

            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Client closed the command channel");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Error reading from command channel: {}", e);
                        break;
                    }
                };
                summary.bytes_read += n;

                let fed = framer
                    .feed(&buf[..n])
                    .map(|lines| lines.collect::<Vec<_>>());
                let lines = match fed {
                    Ok(lines) => lines,
                    Err(e) => {
                        warn!("Dropping oversized command: {}", e);
                        summary.oversized += 1;
                        framer
                            .feed(&[])
                            .map(|lines| lines.collect())
                            .unwrap_or_default()
                    }
                };

                for line in lines {
                    summary.record(dispatcher.dispatch(&line).await);
                }

                reporter.request_report();
            }

            if let Some(rest) = framer.finish() {
                summary.record(dispatcher.dispatch(&rest).await);
            }
        }

        channel.detach().await;
        dispatcher.abort_file_transfer().await;
        startup.abort();
        let _ = startup.await;
        self.machine.shutdown().await;
        info!("Command channel closed, machine released");

        summary
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

    use super::*;
    use crate::machine::SimulatedMachine;
    use crate::machine::simulated::MachineCall;

    fn manager(machine: Arc<SimulatedMachine>) -> ConnectionManager {
        let mut config = BridgeConfig::default();
        config.command_channel.max_line_length = 32;
        config.reporting.poll_interval_ms = 20;
        config.reporting.poll_timeout_ms = 10;
        ConnectionManager::new(config, machine)
    }

    #[tokio::test]
    async fn session_greets_dispatches_and_releases_machine() {
        let machine = Arc::new(SimulatedMachine::new());
        let manager = manager(machine.clone());
        let (client, server) = tokio::io::duplex(4096);

        let session = tokio::spawn(async move { manager.run_session(server).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("Paper Tools connected.")
        );

        write_half.write_all(b"/SetPosX 10mm\nhello\n/GetPos").await.unwrap();
        write_half.shutdown().await.unwrap();

        // Drain reports so the session never blocks on a full pipe.
        while lines.next_line().await.unwrap().is_some() {}

        let summary = session.await.unwrap();
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.ignored, 1);
        assert_eq!(machine.gcode_history(), vec!["G0 X10mm"]);
        assert_eq!(machine.count(&MachineCall::Shutdown), 1);
        assert!(!machine.is_initialized());
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_without_closing() {
        let machine = Arc::new(SimulatedMachine::new());
        let manager = manager(machine.clone());
        let (client, server) = tokio::io::duplex(4096);

        let session = tokio::spawn(async move { manager.run_session(server).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        let drain = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while lines.next_line().await.unwrap().is_some() {}
        });

        let long = format!("/Execute {}", "X".repeat(100));
        write_half.write_all(long.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        write_half.write_all(b"XXXX\n/SetPosY 2\n").await.unwrap();
        write_half.shutdown().await.unwrap();

        let summary = session.await.unwrap();
        drain.await.unwrap();

        assert!(summary.oversized >= 1);
        assert_eq!(machine.gcode_history(), vec!["G0 Y2"]);
        assert_eq!(machine.count(&MachineCall::Shutdown), 1);
    }

    #[tokio::test]
    async fn reports_position_while_connected() {
        let machine = Arc::new(SimulatedMachine::new());
        machine.set_position_override(Some(crate::models::Position::new(1.0, 2.0, 3.0)));
        let manager = manager(machine.clone());
        let (client, server) = tokio::io::duplex(4096);

        let session = tokio::spawn(async move { manager.run_session(server).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut lines = BufReader::new(read_half).lines();
        lines.next_line().await.unwrap();

        let report = lines.next_line().await.unwrap();
        assert_eq!(report.as_deref(), Some("/position 1 2 3"));

        write_half.shutdown().await.unwrap();
        while lines.next_line().await.unwrap().is_some() {}
        session.await.unwrap();

        assert_eq!(machine.count(&MachineCall::Initialize), 1);
        assert_eq!(machine.count(&MachineCall::Shutdown), 1);
    }

    #[tokio::test]
    async fn jog_stop_reaches_the_machine_when_the_client_stops_reading() {
        let machine = Arc::new(SimulatedMachine::new());
        let mut config = BridgeConfig::default();
        config.reporting.poll_interval_ms = 5;
        config.reporting.poll_timeout_ms = 5;
        config.command_channel.write_timeout_ms = 100;
        let manager = ConnectionManager::new(config, machine.clone());
        let (client, server) = tokio::io::duplex(256);

        let session = tokio::spawn(async move { manager.run_session(server).await });

        // The read half is kept but never read, so reports pile up.
        let (_read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"/JogStop\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        write_half.write_all(b"/JogStop\n").await.unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(2), async {
            while machine.count(&MachineCall::CancelMotion) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(stopped.is_ok(), "second JogStop never reached the machine");

        write_half.shutdown().await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.lines, 2);
        assert_eq!(machine.count(&MachineCall::Shutdown), 1);
    }

    #[tokio::test]
    async fn connect_gives_up_after_configured_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = BridgeConfig::default();
        config.command_channel.port = port;
        config.command_channel.connect_retries = 2;
        config.command_channel.retry_delay_ms = 10;
        let manager = ConnectionManager::new(config, Arc::new(SimulatedMachine::new()));

        let err = manager.connect().await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
