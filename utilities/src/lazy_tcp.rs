use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

/// Blocking TCP stream that connects on first use and transparently
/// reconnects once after the peer resets the connection.
pub struct LazyTcpStream {
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    max_retries: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    connect_timeout: Duration,
}

fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

impl LazyTcpStream {
    pub fn new<A: ToSocketAddrs>(
        addr: A,
        max_retries: u32,
        read_timeout: Duration,
        write_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        LazyTcpStream {
            addr: addr.to_socket_addrs().ok().and_then(|mut addrs| addrs.next()),
            stream: None,
            max_retries,
            read_timeout,
            write_timeout,
            connect_timeout,
        }
    }

    fn connect(&mut self) -> io::Result<()> {
        let addr = self
            .addr
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "Unresolvable address"))?;

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    stream.set_nodelay(true)?;

                    debug!("Connected to {} on attempt {}", addr, attempt + 1);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt + 1, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::other("Max connection retries reached")))
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            self.connect()?;
        }

        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "Stream is not connected"))
    }

    /// Second handle to the current connection, for writers that must not
    /// wait for the owner of this stream.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "Stream is not connected"))?
            .try_clone()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn reconnect(&mut self) -> io::Result<()> {
        self.disconnect();
        self.connect()
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Reads whatever is pending, treating a timeout as "nothing to read".
    pub fn drain(&mut self) -> io::Result<usize> {
        let mut buf = [0; 1024];
        let mut total = 0;

        loop {
            let result = self.stream()?.read(&mut buf);
            match result {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Read for LazyTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream()?.read(buf);
        match result {
            Err(e) if is_connection_lost(&e) => {
                warn!("Connection lost while reading: {}", e);
                self.reconnect()?;
                self.stream()?.read(buf)
            }
            result => result,
        }
    }
}

impl Write for LazyTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream()?.write(buf);
        match result {
            Err(e) if is_connection_lost(&e) => {
                warn!("Connection lost while writing: {}", e);
                self.reconnect()?;
                self.stream()?.write(buf)
            }
            result => result,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}
