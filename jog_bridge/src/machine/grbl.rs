//! GRBL-compatible controller reached over TCP (network GRBL boards or a
//! serial-to-TCP bridge). The socket is blocking, so all traffic runs on a
//! dedicated handler thread fed through a [`CommandExecutor`].

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read as _, Write as _};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use utilities::busy_gate::BusyGate;
use utilities::command_executor::{Command, CommandExecutor, CommandSender, DeviceHandler};
use utilities::lazy_tcp::LazyTcpStream;
use utilities::line_framer::LineFramer;

use super::MachineInterface;
use crate::config::MachineConfig;
use crate::error::MachineError;
use crate::models::Position;

/// Real-time command: cancel the active jog and flush the jog queue.
pub const JOG_CANCEL: u8 = 0x85;
/// Real-time command: request a status report.
pub const STATUS_QUERY: u8 = b'?';

const WAKE_UP: &[u8] = b"\r\n\r\n";
const STARTUP_SETTLE: Duration = Duration::from_millis(100);

/// Write handle for real-time bytes that bypasses the command queue.
///
/// GRBL acts on real-time bytes wherever they land in the stream, so they
/// may be written while the handler thread is blocked waiting for a reply.
#[derive(Clone, Default)]
pub struct RealtimeLine {
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl RealtimeLine {
    fn slot(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, stream: Option<TcpStream>) {
        *self.slot() = stream;
    }

    pub fn write(&self, byte: u8) -> io::Result<()> {
        let mut slot = self.slot();
        let stream = slot
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "No controller connection"))?;
        stream.write_all(&[byte])?;
        stream.flush()
    }
}

pub struct GrblHandler {
    stream: LazyTcpStream,
    framer: LineFramer,
    pending: VecDeque<String>,
    response_timeout: Duration,
    realtime: RealtimeLine,
}

impl GrblHandler {
    pub fn new(stream: LazyTcpStream, response_timeout: Duration, realtime: RealtimeLine) -> Self {
        Self {
            stream,
            framer: LineFramer::default(),
            pending: VecDeque::new(),
            response_timeout,
            realtime,
        }
    }

    fn disconnect(&mut self) {
        self.realtime.set(None);
        self.stream.disconnect();
    }

    fn connect(&mut self) -> io::Result<()> {
        self.stream.reconnect()?;
        self.stream.write_all(WAKE_UP)?;
        self.stream.flush()?;

        std::thread::sleep(STARTUP_SETTLE);
        let banner = self.stream.drain()?;
        debug!("Discarded {} bytes of start-up output", banner);

        self.framer = LineFramer::default();
        self.pending.clear();

        match self.stream.try_clone_stream() {
            Ok(stream) => self.realtime.set(Some(stream)),
            Err(e) => {
                warn!("Real-time commands will be queued: {}", e);
                self.realtime.set(None);
            }
        }
        Ok(())
    }

    fn read_line(&mut self, deadline: Instant) -> io::Result<String> {
        let mut buf = [0; 256];

        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(ErrorKind::TimedOut, "No response from controller"));
            }

            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.disconnect();
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "Controller closed the connection",
                    ));
                }
                Ok(n) => match self.framer.feed(&buf[..n]) {
                    Ok(lines) => self
                        .pending
                        .extend(lines.filter(|line| !line.trim().is_empty())),
                    Err(e) => warn!("Discarding controller output: {}", e),
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.pending.clear();
        self.stream.write_all(line.trim_end().as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let response = self.read_line(deadline)?;
            let response = response.trim();

            if response == "ok" {
                return Ok(());
            }
            if response.starts_with("error:") || response.starts_with("ALARM:") {
                return Err(io::Error::other(format!("{} for {:?}", response, line)));
            }
            debug!("Ignoring controller output while waiting for ok: {}", response);
        }
    }

    fn query_status(&mut self) -> io::Result<Position> {
        self.stream.write_all(&[STATUS_QUERY])?;
        self.stream.flush()?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let response = self.read_line(deadline)?;
            if let Some(position) = parse_status_report(&response) {
                return Ok(position);
            }
        }
    }

    fn send_realtime(&mut self, byte: u8) -> io::Result<()> {
        self.stream.write_all(&[byte])?;
        self.stream.flush()
    }
}

pub enum GrblCommand {
    Connect,
    Line(String),
    Status,
    Realtime(u8),
    Disconnect,
}

pub enum GrblResponse {
    Done,
    Position(Position),
}

impl DeviceHandler for GrblHandler {
    type Command = GrblCommand;
}

impl Command for GrblCommand {
    type Response = GrblResponse;
    type Handler = GrblHandler;

    fn execute(self, handler: &mut GrblHandler) -> io::Result<GrblResponse> {
        match self {
            GrblCommand::Connect => handler.connect().map(|_| GrblResponse::Done),
            GrblCommand::Line(line) => handler.send_line(&line).map(|_| GrblResponse::Done),
            GrblCommand::Status => handler.query_status().map(GrblResponse::Position),
            GrblCommand::Realtime(byte) => handler.send_realtime(byte).map(|_| GrblResponse::Done),
            GrblCommand::Disconnect => {
                handler.disconnect();
                Ok(GrblResponse::Done)
            }
        }
    }
}

/// Pulls the coordinates out of a `<Idle|MPos:1.000,2.000,3.000|FS:0,0>`
/// report. Work coordinates win over machine coordinates when both are sent.
pub fn parse_status_report(line: &str) -> Option<Position> {
    let body = line.trim().strip_prefix('<')?.strip_suffix('>')?;

    let mut machine_pos = None;
    let mut work_pos = None;
    for field in body.split('|') {
        if let Some(values) = field.strip_prefix("MPos:") {
            machine_pos = parse_coordinates(values);
        } else if let Some(values) = field.strip_prefix("WPos:") {
            work_pos = parse_coordinates(values);
        }
    }

    work_pos.or(machine_pos)
}

fn parse_coordinates(values: &str) -> Option<Position> {
    let mut coords = values.split(',').map(|v| v.trim().parse::<f64>());
    let x = coords.next()?.ok()?;
    let y = coords.next()?.ok()?;
    let z = coords.next()?.ok()?;
    Some(Position::new(x, y, z))
}

pub struct GrblMachine {
    sender: CommandSender<GrblCommand>,
    address: String,
    realtime: RealtimeLine,
    /// Held by the one status query allowed in the queue at a time.
    status_poll: Arc<BusyGate>,
    _executor: tokio::task::JoinHandle<io::Result<()>>,
}

impl GrblMachine {
    /// Starts the handler thread; must be called from within a Tokio runtime.
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub fn from_config(config: &MachineConfig) -> Self {
        let address = format!("{}:{}", config.host, config.port);
        let stream = LazyTcpStream::new(
            address.as_str(),
            config.connect_retries,
            config.io_timeout(),
            config.io_timeout(),
            config.connect_timeout(),
        );

        let realtime = RealtimeLine::default();
        let (executor, sender) = CommandExecutor::new(GrblHandler::new(
            stream,
            config.response_timeout(),
            realtime.clone(),
        ));
        let executor = executor.spawn();

        info!("GRBL handler started for {}", address);
        Self {
            sender,
            address,
            realtime,
            status_poll: Arc::new(BusyGate::new()),
            _executor: executor,
        }
    }

    async fn send(&self, command: GrblCommand) -> io::Result<GrblResponse> {
        self.sender.send_command(command).await
    }
}

#[async_trait]
impl MachineInterface for GrblMachine {
    async fn initialize(&self) -> Result<(), MachineError> {
        info!("Connecting to controller at {}", self.address);
        self.send(GrblCommand::Connect)
            .await
            .map(|_| ())
            .map_err(|e| MachineError::Connect(e.to_string()))
    }

    /// The query runs in its own task so a caller that times out does not
    /// leave a second query queued behind the first.
    async fn read_position(&self) -> Result<Position, MachineError> {
        let sender = self.sender.clone();
        let gate = self.status_poll.clone();
        let query = tokio::spawn(async move {
            let Some(_polling) = gate.try_acquire() else {
                return Err(MachineError::Read("status query already in flight".to_string()));
            };
            match sender.send_command(GrblCommand::Status).await {
                Ok(GrblResponse::Position(position)) => Ok(position),
                Ok(GrblResponse::Done) => Err(MachineError::Read("no status report".to_string())),
                Err(e) => Err(MachineError::Read(e.to_string())),
            }
        });

        query
            .await
            .map_err(|e| MachineError::Read(e.to_string()))?
    }

    async fn issue_gcode(&self, line: &str) -> Result<(), MachineError> {
        debug!("Sending G-code {:?}", line);
        self.send(GrblCommand::Line(line.to_string()))
            .await
            .map(|_| ())
            .map_err(|e| MachineError::Actuator(e.to_string()))
    }

    async fn cancel_motion(&self) -> Result<(), MachineError> {
        let realtime = self.realtime.clone();
        match tokio::task::spawn_blocking(move || realtime.write(JOG_CANCEL)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => debug!("Queueing jog cancel: {}", e),
            Err(e) => warn!("Jog cancel writer failed: {}", e),
        }

        self.send(GrblCommand::Realtime(JOG_CANCEL))
            .await
            .map(|_| ())
            .map_err(|e| MachineError::Actuator(e.to_string()))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.send(GrblCommand::Disconnect).await {
            warn!("Failed to close controller connection: {}", e);
        }
        info!("Disconnected from controller at {}", self.address);
    }
}
