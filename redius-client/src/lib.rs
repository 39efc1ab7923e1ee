//! # redius Sync Client
//!
//! Purpose: Provide a lightweight, synchronous Redis-compatible client with
//! connection pooling to minimize TCP handshake and `AUTH` overhead.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections; build them lazily, up to a
//!    fixed capacity, authenticating each one before first use.
//! 2. **Explicit Ownership**: One `ConnectionPool` per store target, passed
//!    to every `StoreClient` that talks to it.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Example
//!
//! ```no_run
//! use redius_client::{ClientConfig, PoolConfig, StoreClient};
//!
//! let config = ClientConfig {
//!     pool: PoolConfig::tcp("127.0.0.1:6379", 4),
//!     ..ClientConfig::default()
//! };
//! let client = StoreClient::initialize(config)?;
//! client.set("greeting", "hello")?;
//! assert_eq!(client.get("greeting")?, "hello");
//! client.shutdown();
//! # Ok::<(), redius_client::ClientError>(())
//! ```

mod client;
mod config;
mod connection;
mod error;
mod pool;
mod resp;

pub use client::{Limit, ScanPage, ScoreBound, StoreClient};
pub use config::{BlockingPolicy, ClientConfig, Credential, ErrorMode, Network, PoolConfig};
pub use connection::{ConnectionFactory, RespSession, Session, StoreConnector};
pub use error::{ClientError, ClientResult};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use resp::{Command, RespValue, ToArg};
