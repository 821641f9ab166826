use std::sync::Arc;
use std::time::Duration;

use jog_bridge::config::BridgeConfig;
use jog_bridge::connection::ConnectionManager;
use jog_bridge::machine::SimulatedMachine;
use tokio::io::{AsyncBufReadExt as _, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

/// Plays the client application: listens where the bridge connects to.
pub struct ClientApp {
    pub listener: TcpListener,
    pub config: BridgeConfig,
}

impl ClientApp {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = BridgeConfig::default();
        config.command_channel.port = listener.local_addr().unwrap().port();
        config.command_channel.retry_delay_ms = 10;
        config.reporting.poll_interval_ms = 20;
        config.reporting.poll_timeout_ms = 10;

        Self { listener, config }
    }

    pub fn bridge(&self, machine: Arc<SimulatedMachine>) -> ConnectionManager {
        ConnectionManager::new(self.config.clone(), machine)
    }

    pub async fn accept(&self) -> Session {
        let (stream, _) = self.listener.accept().await.unwrap();
        Session::new(stream)
    }
}

pub struct Session {
    pub lines: Lines<BufReader<OwnedReadHalf>>,
    pub writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("bridge went quiet")
            .unwrap()
    }

    /// Reads until a line that is not a position report arrives.
    pub async fn next_non_report(&mut self) -> Option<String> {
        loop {
            match self.next_line().await {
                Some(line) if line.starts_with("/position") => continue,
                other => return other,
            }
        }
    }

    pub async fn drain(mut self) {
        while self.next_line().await.is_some() {}
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
