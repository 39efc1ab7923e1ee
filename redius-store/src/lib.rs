//! In-memory RESP2 store.
//!
//! Implements the command set `redius-client` issues, including `AUTH`, on
//! top of a single locked keyspace. Keys with a deadline expire lazily on
//! access.
//!
//! [`spawn_tcp`] and [`spawn_unix`] run a server on a background thread with
//! its own runtime, so synchronous callers and tests can use it directly.

mod db;
mod glob;
mod protocol;
mod server;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

pub use db::{Db, DbError, DbResult, ScanResult, ScoreBound};
pub use glob::glob_match;
pub use protocol::{RespError, RespParser};
pub use server::{handle_connection, Server, ServerConfig, ServerStats};

/// Default listen address of the `redius-store` binary.
pub const DEFAULT_ADDR: &str = "127.0.0.1:6380";

/// Accepts TCP connections until `shutdown` completes.
pub async fn serve<F: Future>(
    listener: TcpListener,
    server: Arc<Server>,
    shutdown: F,
) -> io::Result<()> {
    tokio::select! {
        result = accept_tcp(&listener, &server) => result,
        _ = shutdown => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn accept_tcp(listener: &TcpListener, server: &Arc<Server>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(|err| {
            error!(error = %err, "accept failed");
            err
        })?;
        let _ = stream.set_nodelay(true);
        debug!(%peer, "accepted connection");

        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, server).await {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}

/// Accepts Unix domain socket connections until `shutdown` completes.
#[cfg(unix)]
pub async fn serve_unix<F: Future>(
    listener: tokio::net::UnixListener,
    server: Arc<Server>,
    shutdown: F,
) -> io::Result<()> {
    tokio::select! {
        result = accept_unix(&listener, &server) => result,
        _ = shutdown => {
            info!("shutting down");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn accept_unix(listener: &tokio::net::UnixListener, server: &Arc<Server>) -> io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        debug!("accepted unix connection");

        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, server).await {
                debug!(error = %err, "connection closed with error");
            }
        });
    }
}

/// A server running on a background thread. Dropping it stops the server.
pub struct ServerHandle {
    address: String,
    server: Arc<Server>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl ServerHandle {
    /// `host:port` for TCP servers, the socket path for Unix servers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.server.stats().connections
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(Err(err)) => error!(error = %err, "store thread failed"),
                Err(_) => error!("store thread panicked"),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binds `addr` (port 0 picks a free port) and serves it on a new thread.
pub fn spawn_tcp(addr: &str, config: ServerConfig) -> io::Result<ServerHandle> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local: SocketAddr = listener.local_addr()?;

    let server = Arc::new(Server::new(config));
    let (tx, rx) = oneshot::channel();
    let runtime = build_runtime()?;
    let thread_server = server.clone();
    let thread = std::thread::Builder::new()
        .name("redius-store".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = TcpListener::from_std(listener)?;
                serve(listener, thread_server, rx).await
            })
        })?;

    Ok(ServerHandle {
        address: local.to_string(),
        server,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}

/// Binds a Unix socket at `path` and serves it on a new thread.
#[cfg(unix)]
pub fn spawn_unix(path: &std::path::Path, config: ServerConfig) -> io::Result<ServerHandle> {
    let listener = std::os::unix::net::UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;

    let server = Arc::new(Server::new(config));
    let (tx, rx) = oneshot::channel();
    let runtime = build_runtime()?;
    let thread_server = server.clone();
    let thread = std::thread::Builder::new()
        .name("redius-store-unix".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = tokio::net::UnixListener::from_std(listener)?;
                serve_unix(listener, thread_server, rx).await
            })
        })?;

    Ok(ServerHandle {
        address: path.to_string_lossy().into_owned(),
        server,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}

fn build_runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn spawned_server_answers_ping() {
        let handle = spawn_tcp("127.0.0.1:0", ServerConfig::default()).unwrap();
        let mut stream = std::net::TcpStream::connect(handle.address()).unwrap();
        stream.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();

        let mut reply = [0u8; 7];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"+PONG\r\n");
        assert_eq!(handle.connections(), 1);
        handle.shutdown();
    }
}
