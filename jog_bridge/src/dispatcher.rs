use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use utilities::busy_gate::BusyGate;

use crate::config::FileChannelConfig;
use crate::error::DispatchError;
use crate::file_channel::{self, FileTransfer};
use crate::instruction::{Instruction, parse_instruction};
use crate::jog::JogStateTracker;
use crate::machine::MachineInterface;
use crate::reporter::PositionReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No known marker in the line.
    Ignored,
    Completed,
    /// Another G-code call was in flight; the instruction was dropped.
    Busy,
    Failed,
}

/// Turns command lines into machine calls for one connection.
pub struct CommandDispatcher {
    machine: Arc<dyn MachineInterface>,
    reporter: Arc<PositionReporter>,
    jog: Mutex<JogStateTracker>,
    gate: BusyGate,
    file_channel: FileChannelConfig,
    file_transfer: Mutex<Option<JoinHandle<Option<FileTransfer>>>>,
}

impl CommandDispatcher {
    pub fn new(
        machine: Arc<dyn MachineInterface>,
        reporter: Arc<PositionReporter>,
        file_channel: FileChannelConfig,
    ) -> Self {
        Self {
            machine,
            reporter,
            jog: Mutex::new(JogStateTracker::new()),
            gate: BusyGate::new(),
            file_channel,
            file_transfer: Mutex::new(None),
        }
    }

    /// Opens the file channel unless a transfer is still running.
    async fn start_file_transfer(&self) {
        let mut transfer = self.file_transfer.lock().await;
        if transfer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("File transfer already running, ignoring FileStart");
            return;
        }
        *transfer = Some(file_channel::spawn_receive(self.file_channel.clone()));
    }

    /// Stops a running file transfer; called when the session ends.
    pub async fn abort_file_transfer(&self) {
        if let Some(handle) = self.file_transfer.lock().await.take() {
            if !handle.is_finished() {
                debug!("Aborting file transfer");
            }
            handle.abort();
        }
    }

    pub async fn dispatch(&self, line: &str) -> DispatchOutcome {
        let Some(instruction) = parse_instruction(line) else {
            trace!("Ignoring line {:?}", line);
            return DispatchOutcome::Ignored;
        };
        let name = instruction.name();
        debug!("Dispatching {} from {:?}", name, line);

        let result = if instruction.issues_gcode() {
            let Some(_guard) = self.gate.try_acquire() else {
                warn!("Machine busy, dropping {}", name);
                return DispatchOutcome::Busy;
            };
            self.execute(instruction).await
        } else {
            self.execute(instruction).await
        };

        match result {
            Ok(()) => DispatchOutcome::Completed,
            Err(e) => {
                warn!("{} failed: {}", name, e);
                DispatchOutcome::Failed
            }
        }
    }

    async fn execute(&self, instruction: Instruction) -> Result<(), DispatchError> {
        match instruction {
            Instruction::FileStart { .. } => {
                self.start_file_transfer().await;
            }
            Instruction::JogStop => {
                self.jog.lock().await.stop();
                self.machine.cancel_motion().await?;
            }
            Instruction::JogIncrement { payload } => {
                debug!("Incremental jog {:?} is not supported, ignoring", payload);
            }
            Instruction::JogStart {
                direction,
                axis,
                feedrate,
            } => {
                let command = self.jog.lock().await.start_raw(direction, axis, &feedrate)?;
                self.machine.issue_gcode(&command.gcode).await?;
            }
            Instruction::Execute { gcode } => {
                self.machine.issue_gcode(&gcode).await?;
            }
            Instruction::SetPos { axis, value } => {
                self.machine
                    .issue_gcode(&format!("G0 {}{}", axis, value))
                    .await?;
            }
            Instruction::GetPos => {
                self.reporter.request_report();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::channel::CommandChannel;
    use crate::machine::SimulatedMachine;
    use crate::machine::simulated::MachineCall;
    use crate::models::{JogCommandSnapshot, JogDirection};

    struct Fixture {
        machine: Arc<SimulatedMachine>,
        channel: Arc<CommandChannel>,
        reporter: Arc<PositionReporter>,
        dispatcher: Arc<CommandDispatcher>,
    }

    fn fixture_with(machine: SimulatedMachine) -> Fixture {
        fixture_with_files(machine, FileChannelConfig::default())
    }

    fn fixture_with_files(machine: SimulatedMachine, file_channel: FileChannelConfig) -> Fixture {
        let machine = Arc::new(machine);
        let channel = Arc::new(CommandChannel::new());
        let reporter = Arc::new(PositionReporter::new(
            machine.clone(),
            channel.clone(),
            Duration::from_millis(50),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            machine.clone(),
            reporter.clone(),
            file_channel,
        ));

        Fixture {
            machine,
            channel,
            reporter,
            dispatcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SimulatedMachine::new())
    }

    #[tokio::test]
    async fn set_pos_issues_absolute_move() {
        let f = fixture();

        assert_eq!(
            f.dispatcher.dispatch("/SetPosX 10mm").await,
            DispatchOutcome::Completed
        );
        assert_eq!(f.dispatcher.dispatch("/SetPosZ -2").await, DispatchOutcome::Completed);
        assert_eq!(f.machine.gcode_history(), vec!["G0 X10mm", "G0 Z-2"]);
    }

    #[tokio::test]
    async fn execute_forwards_raw_gcode() {
        let f = fixture();

        f.dispatcher.dispatch("Execute G28").await;
        assert_eq!(f.machine.gcode_history(), vec!["G28"]);
    }

    #[tokio::test]
    async fn jog_start_then_stop() {
        let f = fixture();

        assert_eq!(
            f.dispatcher.dispatch("/JogStart+X 500").await,
            DispatchOutcome::Completed
        );
        assert_eq!(f.dispatcher.dispatch("/JogStop").await, DispatchOutcome::Completed);

        assert_eq!(
            f.machine.calls(),
            vec![
                MachineCall::IssueGcode("$J=G21G91 X+0.1  F1000".to_string()),
                MachineCall::CancelMotion,
            ]
        );
        // Stop leaves the tracked jog in place.
        assert_eq!(
            f.dispatcher.jog.lock().await.snapshot().x.direction,
            JogDirection::Positive
        );
    }

    #[tokio::test]
    async fn higher_priority_marker_wins() {
        let f = fixture();

        f.dispatcher.dispatch("Execute GetPos").await;
        assert_eq!(f.machine.calls(), vec![MachineCall::IssueGcode("GetPos".to_string())]);
    }

    #[tokio::test]
    async fn unknown_and_reserved_lines_touch_nothing() {
        let f = fixture();

        assert_eq!(f.dispatcher.dispatch("hello").await, DispatchOutcome::Ignored);
        assert_eq!(f.dispatcher.dispatch("").await, DispatchOutcome::Ignored);
        assert_eq!(
            f.dispatcher.dispatch("/JogInc X 0.1").await,
            DispatchOutcome::Completed
        );
        assert!(f.machine.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_jog_is_dropped() {
        let f = fixture();

        assert_eq!(
            f.dispatcher.dispatch("/JogStart+Q 500").await,
            DispatchOutcome::Failed
        );
        assert!(f.machine.calls().is_empty());
        assert_eq!(f.dispatcher.jog.lock().await.snapshot(), JogCommandSnapshot::default());
    }

    #[tokio::test]
    async fn machine_errors_are_reported_as_failed() {
        let f = fixture();
        f.machine.set_fail_gcode(true);

        assert_eq!(f.dispatcher.dispatch("/SetPosY 3").await, DispatchOutcome::Failed);
        // The gate is released after a failure.
        f.machine.set_fail_gcode(false);
        assert_eq!(f.dispatcher.dispatch("/SetPosY 3").await, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn gcode_while_busy_is_dropped_not_queued() {
        let f = fixture_with(SimulatedMachine::with_gcode_delay(Duration::from_millis(200)));

        let first = {
            let dispatcher = f.dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch("/SetPosX 1").await })
        };
        while f.machine.gcode_history().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(f.dispatcher.dispatch("/SetPosY 2").await, DispatchOutcome::Busy);
        assert_eq!(
            f.dispatcher.dispatch("/JogStart+X 500").await,
            DispatchOutcome::Busy
        );
        // Stop is never gated.
        assert_eq!(f.dispatcher.dispatch("/JogStop").await, DispatchOutcome::Completed);

        assert_eq!(first.await.unwrap(), DispatchOutcome::Completed);
        assert_eq!(f.machine.gcode_history(), vec!["G0 X1"]);
        assert_eq!(f.machine.count(&MachineCall::CancelMotion), 1);

        assert_eq!(f.dispatcher.dispatch("/SetPosY 2").await, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn get_pos_triggers_a_report() {
        let f = fixture();
        let (client, server) = tokio::io::duplex(256);
        f.channel.attach(Box::new(client)).await;
        let mut lines = BufReader::new(server).lines();

        let reporting = tokio::spawn(f.reporter.clone().run(Duration::from_secs(3600)));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("/position 0 0 0"));

        f.dispatcher.dispatch("/SetPosX 4").await;
        assert_eq!(f.dispatcher.dispatch("/GetPos").await, DispatchOutcome::Completed);
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("/position 4 0 0"));

        reporting.abort();
        f.channel.detach().await;
    }

    async fn file_listener() -> (TcpListener, FileChannelConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = FileChannelConfig {
            port: listener.local_addr().unwrap().port(),
            ..FileChannelConfig::default()
        };
        (listener, config)
    }

    #[tokio::test]
    async fn file_start_opens_the_file_channel() {
        let (listener, config) = file_listener().await;
        let f = fixture_with_files(SimulatedMachine::new(), config);

        assert_eq!(f.dispatcher.dispatch("/FileStart").await, DispatchOutcome::Completed);
        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(accepted.is_ok());
        assert!(f.machine.calls().is_empty());
    }

    #[tokio::test]
    async fn only_one_file_transfer_runs_at_a_time() {
        let (listener, config) = file_listener().await;
        let f = fixture_with_files(SimulatedMachine::new(), config);

        f.dispatcher.dispatch("/FileStart").await;
        let (mut first, _) = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();

        f.dispatcher.dispatch("/FileStart").await;
        let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err(), "a second file connection was opened");

        // Aborting drops the connection, which the client sees as EOF.
        f.dispatcher.abort_file_transfer().await;
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), first.read_to_end(&mut rest)).await;
        assert!(matches!(read, Ok(Ok(0))));

        // Once the old transfer is gone a new FileStart connects again.
        f.dispatcher.dispatch("/FileStart").await;
        let third = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn get_pos_without_client_is_harmless() {
        let f = fixture();

        assert_eq!(f.dispatcher.dispatch("GetPos").await, DispatchOutcome::Completed);
        assert!(f.machine.calls().is_empty());
    }
}
