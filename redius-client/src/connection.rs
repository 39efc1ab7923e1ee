//! # Connections and the Connection Factory
//!
//! Purpose: Open a socket to the store, authenticate it when a credential is
//! configured, and expose it as a `Session` the pool can lend out.
//!
//! ## Design Principles
//! 1. **Factory Pattern**: The pool only sees `ConnectionFactory`, so tests can
//!    hand it in-memory sessions.
//! 2. **Authenticated or Nothing**: A session leaves the factory only after
//!    `AUTH` succeeded (or when no credential is configured).
//! 3. **Cache-Friendly Buffers**: Each session reuses its own buffers.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Credential, Network, PoolConfig};
use crate::error::{ClientError, ClientResult};
use crate::resp::{read_response, Command, RespValue};

/// A live request/response session with the store.
///
/// Implementations are never shared: the pool hands a session to exactly one
/// holder at a time.
pub trait Session: Send {
    /// Sends one command and reads its reply.
    fn send(&mut self, command: &Command) -> ClientResult<RespValue>;

    /// Closes the underlying transport. Later `send` calls fail.
    fn close(&mut self);
}

/// Builds ready-to-use sessions for the pool.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, address: &str, network: Network) -> ClientResult<Box<dyn Session>>;
}

/// Default factory: opens a TCP or Unix socket and runs `AUTH` if configured.
#[derive(Debug, Clone, Default)]
pub struct StoreConnector {
    credential: Option<Credential>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl StoreConnector {
    pub fn new(credential: Option<Credential>) -> Self {
        StoreConnector {
            credential,
            ..StoreConnector::default()
        }
    }

    /// Builds a connector from the credential and timeouts of `config`.
    pub fn from_config(config: &PoolConfig) -> Self {
        StoreConnector {
            credential: config.credential.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }

    fn open(&self, address: &str, network: Network) -> ClientResult<Stream> {
        let stream = match network {
            Network::Tcp => Stream::Tcp(self.connect_tcp(address)?),
            Network::Unix => Stream::connect_unix(address)?,
        };
        stream
            .set_timeouts(self.read_timeout, self.write_timeout)
            .map_err(|source| ClientError::Connect {
                address: address.to_string(),
                source,
            })?;
        Ok(stream)
    }

    fn connect_tcp(&self, address: &str) -> ClientResult<TcpStream> {
        let addrs = address
            .to_socket_addrs()
            .map_err(|_| ClientError::InvalidAddress)?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = match self.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    // Disable Nagle to keep request latency low for small payloads.
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }

        match last_err {
            Some(source) => Err(ClientError::Connect {
                address: address.to_string(),
                source,
            }),
            None => Err(ClientError::InvalidAddress),
        }
    }
}

impl ConnectionFactory for StoreConnector {
    fn connect(&self, address: &str, network: Network) -> ClientResult<Box<dyn Session>> {
        let mut session = RespSession::new(self.open(address, network)?);

        let credential = match &self.credential {
            Some(credential) => credential,
            None => {
                debug!(%address, %network, "opened connection");
                return Ok(Box::new(session));
            }
        };

        let reply = session.send(&Command::new("AUTH").arg(credential.expose()));
        match reply {
            Ok(RespValue::Error(message)) => {
                session.close();
                let message = String::from_utf8_lossy(&message).into_owned();
                warn!(%address, %message, "store rejected credential");
                Err(ClientError::AuthFailed { message })
            }
            Ok(_) => {
                debug!(%address, %network, "opened authenticated connection");
                Ok(Box::new(session))
            }
            Err(err) => {
                session.close();
                warn!(%address, error = %err, "authentication round trip failed");
                Err(err)
            }
        }
    }
}

/// Socket to the store, either family.
#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    #[cfg(unix)]
    fn connect_unix(path: &str) -> ClientResult<Stream> {
        UnixStream::connect(path)
            .map(Stream::Unix)
            .map_err(|source| ClientError::Connect {
                address: path.to_string(),
                source,
            })
    }

    #[cfg(not(unix))]
    fn connect_unix(_path: &str) -> ClientResult<Stream> {
        Err(ClientError::InvalidConfig(
            "unix sockets are not supported on this platform".to_string(),
        ))
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => {
                stream.set_read_timeout(read)?;
                stream.set_write_timeout(write)
            }
            #[cfg(unix)]
            Stream::Unix(stream) => {
                stream.set_read_timeout(read)?;
                stream.set_write_timeout(write)
            }
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

/// Single socket session with reusable buffers.
///
/// The buffers are stored on the session to avoid per-call allocations.
#[derive(Debug)]
pub struct RespSession {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Stream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    closed: bool,
}

impl RespSession {
    fn new(stream: Stream) -> Self {
        RespSession {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            closed: false,
        }
    }
}

impl Session for RespSession {
    fn send(&mut self, command: &Command) -> ClientResult<RespValue> {
        if self.closed {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is closed",
            )));
        }

        self.write_buf.clear();
        command.encode(&mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.reader.get_ref().shutdown();
        }
    }
}

impl Drop for RespSession {
    fn drop(&mut self) {
        self.close();
    }
}
