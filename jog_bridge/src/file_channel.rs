//! Secondary connection the client uses to push program files. The content
//! is collected but not interpreted.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::FileChannelConfig;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// At most `max_bytes` of the payload.
    pub data: Vec<u8>,
    pub received: usize,
    pub discarded: usize,
}

/// Reads until EOF, keeping the first `max_bytes` bytes.
pub async fn read_capped<R>(mut reader: R, max_bytes: usize) -> io::Result<FileTransfer>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut received = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        received += n;

        let room = max_bytes.saturating_sub(data.len());
        data.extend_from_slice(&buf[..n.min(room)]);
    }

    let discarded = received - data.len();
    if discarded > 0 {
        warn!("File exceeded {} bytes, discarded {} bytes", max_bytes, discarded);
    }
    info!("Completed receiving file with {} bytes", received);

    Ok(FileTransfer {
        data,
        received,
        discarded,
    })
}

#[instrument(skip(config), fields(address = %config.address()))]
pub async fn receive(config: &FileChannelConfig) -> io::Result<FileTransfer> {
    let stream = TcpStream::connect(config.address()).await?;
    info!("File channel connected");
    read_capped(stream, config.max_bytes).await
}

/// Runs [`receive`] in the background; failures are logged.
pub fn spawn_receive(config: FileChannelConfig) -> JoinHandle<Option<FileTransfer>> {
    tokio::spawn(async move {
        match receive(&config).await {
            Ok(transfer) => Some(transfer),
            Err(e) => {
                warn!("File channel {} failed: {}", config.address(), e);
                None
            }
        }
    })
}
