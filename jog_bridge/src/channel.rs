use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of the command connection.
///
/// Position reports and command handling both write here; the mutex keeps
/// their lines from interleaving. A write that fails or does not finish
/// within the write timeout leaves the channel detached.
pub struct CommandChannel {
    writer: Mutex<Option<BoxedWriter>>,
    connected: AtomicBool,
    write_timeout: Duration,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            write_timeout,
        }
    }

    pub async fn attach(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        debug!("Command channel attached");
    }

    /// Marks the channel disconnected and closes the write half.
    pub async fn detach(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
        }
        debug!("Command channel detached");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if self.is_connected() => writer,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "Command channel is not connected",
                ));
            }
        };

        let result = match tokio::time::timeout(self.write_timeout, write_terminated(writer, line))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Client did not accept data within {:?}", self.write_timeout),
            )),
        };

        if let Err(e) = &result {
            warn!("Command channel write failed, detaching: {}", e);
            self.connected.store(false, Ordering::SeqCst);
            guard.take();
        }
        result
    }
}

async fn write_terminated(writer: &mut BoxedWriter, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}
