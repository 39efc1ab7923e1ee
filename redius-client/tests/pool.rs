use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use redius_client::{
    BlockingPolicy, ClientConfig, ClientError, ClientResult, Command, ConnectionFactory,
    ConnectionPool, Network, PoolConfig, RespValue, Session, StoreClient,
};

/// Counts constructed and closed sessions; every session shares one map.
#[derive(Default)]
struct MockFactory {
    connects: AtomicU64,
    closes: Arc<AtomicU64>,
    reject: AtomicBool,
    panic_next: AtomicBool,
    data: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MockFactory {
    fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for MockFactory {
    fn connect(&self, _address: &str, _network: Network) -> ClientResult<Box<dyn Session>> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("factory blew up");
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(ClientError::AuthFailed {
                message: "WRONGPASS".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            in_use: AtomicBool::new(false),
            closed: false,
            closes: self.closes.clone(),
            data: self.data.clone(),
        }))
    }
}

struct MockSession {
    in_use: AtomicBool,
    closed: bool,
    closes: Arc<AtomicU64>,
    data: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Session for MockSession {
    fn send(&mut self, command: &Command) -> ClientResult<RespValue> {
        assert!(
            !self.in_use.swap(true, Ordering::SeqCst),
            "session used by two callers at once"
        );
        let reply = match command.parts() {
            [name, key, value] if name == b"SET" => {
                self.data.lock().insert(key.clone(), value.clone());
                Ok(RespValue::Simple(b"OK".to_vec()))
            }
            [name, key] if name == b"GET" => {
                Ok(RespValue::Bulk(self.data.lock().get(key).cloned()))
            }
            [name] if name == b"BREAK" => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))),
            _ => Ok(RespValue::Error(b"ERR unknown command".to_vec())),
        };
        self.in_use.store(false, Ordering::SeqCst);
        reply
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn pool_with(capacity: usize, blocking: BlockingPolicy) -> (ConnectionPool, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let config = PoolConfig::tcp("mock:0", capacity).with_blocking(blocking);
    let pool = ConnectionPool::with_factory(config, factory.clone()).expect("pool");
    (pool, factory)
}

#[test]
fn capacity_bounds_construction_and_extra_checkout_waits() {
    let (pool, factory) = pool_with(2, BlockingPolicy::Wait);
    let first = pool.checkout().expect("first");
    let _second = pool.checkout().expect("second");
    assert_eq!(factory.connects(), 2);

    let (tx, rx) = mpsc::channel();
    let waiter_pool = pool.clone();
    let waiter = thread::spawn(move || {
        let conn = waiter_pool.checkout().expect("third");
        tx.send(conn.id()).expect("send");
    });

    thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err(), "third checkout must block");

    let first_id = first.id();
    drop(first);
    let reused = rx.recv_timeout(Duration::from_secs(2)).expect("woken");
    assert_eq!(reused, first_id);
    waiter.join().expect("waiter");
    assert_eq!(factory.connects(), 2);
}

#[test]
fn repeated_checkout_reuses_one_connection() {
    let (pool, factory) = pool_with(4, BlockingPolicy::Wait);
    for _ in 0..100 {
        let conn = pool.checkout().expect("checkout");
        pool.checkin(conn).expect("checkin");
    }
    assert_eq!(factory.connects(), 1);

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.checked_out, 0);
}

#[test]
fn failed_construction_leaves_counts_unchanged() {
    let (pool, factory) = pool_with(1, BlockingPolicy::Wait);
    factory.reject.store(true, Ordering::SeqCst);

    let before = pool.stats();
    assert!(matches!(pool.checkout(), Err(ClientError::AuthFailed { .. })));
    assert_eq!(pool.stats(), before);
    assert_eq!(before.total(), 0);

    // The reserved slot was released, so a later attempt can still build.
    factory.reject.store(false, Ordering::SeqCst);
    let conn = pool.checkout().expect("checkout");
    assert_eq!(pool.stats().checked_out, 1);
    drop(conn);
    assert_eq!(factory.connects(), 1);
}

#[test]
fn panicking_factory_releases_its_slot() {
    let (pool, factory) = pool_with(1, BlockingPolicy::FailFast);
    factory.panic_next.store(true, Ordering::SeqCst);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| pool.checkout().map(|conn| conn.id())));
    assert!(outcome.is_err(), "factory panic should propagate");
    assert_eq!(pool.stats().total(), 0);

    // With capacity 1 a leaked slot would make this fail as exhausted.
    let conn = pool.checkout().expect("checkout after panic");
    assert_eq!(pool.stats().checked_out, 1);
    drop(conn);
    assert_eq!(factory.connects(), 1);
}

#[test]
fn fail_fast_reports_exhaustion() {
    let (pool, _factory) = pool_with(1, BlockingPolicy::FailFast);
    let _held = pool.checkout().expect("checkout");
    match pool.checkout() {
        Err(ClientError::PoolExhausted { capacity }) => assert_eq!(capacity, 1),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("checkout should fail"),
    }
}

#[test]
fn bounded_wait_times_out() {
    let timeout = Duration::from_millis(50);
    let (pool, _factory) = pool_with(1, BlockingPolicy::WaitFor(timeout));
    let _held = pool.checkout().expect("checkout");

    let started = Instant::now();
    match pool.checkout() {
        Err(ClientError::PoolTimeout { waited }) => assert_eq!(waited, timeout),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("checkout should time out"),
    }
    assert!(started.elapsed() >= timeout);
}

#[test]
fn close_wakes_waiters_and_drains_idle() {
    let (pool, factory) = pool_with(1, BlockingPolicy::Wait);
    let held = pool.checkout().expect("checkout");

    let waiter_pool = pool.clone();
    let waiter = thread::spawn(move || waiter_pool.checkout().map(|conn| conn.id()));
    thread::sleep(Duration::from_millis(50));

    pool.close();
    assert!(matches!(waiter.join().expect("waiter"), Err(ClientError::PoolClosed)));
    assert!(pool.is_closed());

    // A connection checked in after close is closed rather than kept.
    drop(held);
    assert_eq!(factory.closes(), 1);
    assert_eq!(pool.stats().total(), 0);
    assert!(matches!(pool.checkout(), Err(ClientError::PoolClosed)));
}

#[test]
fn foreign_checkin_is_rejected() {
    let (origin, _origin_factory) = pool_with(1, BlockingPolicy::Wait);
    let (other, other_factory) = pool_with(1, BlockingPolicy::Wait);

    let conn = origin.checkout().expect("checkout");
    let id = conn.id();
    match other.checkin(conn) {
        Err(ClientError::DoubleRelease { id: rejected }) => assert_eq!(rejected, id),
        other => panic!("expected double release, got {other:?}"),
    }

    // The connection went home; the other pool is untouched.
    assert_eq!(origin.stats().idle, 1);
    assert_eq!(origin.stats().checked_out, 0);
    assert_eq!(other.stats().total(), 0);
    assert_eq!(other_factory.connects(), 0);
}

#[test]
fn broken_connections_return_unless_discarding() {
    let (pool, factory) = pool_with(1, BlockingPolicy::Wait);
    let mut conn = pool.checkout().expect("checkout");
    assert!(conn.exec(&Command::new("BREAK")).is_err());
    assert!(conn.is_broken());
    drop(conn);
    assert_eq!(pool.stats().idle, 1);
    assert_eq!(factory.closes(), 0);

    let factory = Arc::new(MockFactory::default());
    let mut config = PoolConfig::tcp("mock:0", 1);
    config.discard_broken = true;
    let pool = ConnectionPool::with_factory(config, factory.clone()).expect("pool");
    let mut conn = pool.checkout().expect("checkout");
    assert!(conn.exec(&Command::new("BREAK")).is_err());
    drop(conn);
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(factory.closes(), 1);

    pool.checkout().expect("replacement");
    assert_eq!(factory.connects(), 2);
}

#[test]
fn invalid_config_is_rejected() {
    let factory = Arc::new(MockFactory::default());
    let result = ConnectionPool::with_factory(PoolConfig::tcp("mock:0", 0), factory);
    assert!(matches!(result, Err(ClientError::InvalidConfig(_))));

    let config = ClientConfig {
        pool: PoolConfig::tcp("", 4),
        ..ClientConfig::default()
    };
    assert!(matches!(
        StoreClient::initialize(config),
        Err(ClientError::InvalidConfig(_))
    ));
}

#[test]
fn concurrent_clients_share_a_small_pool() {
    const CAPACITY: usize = 5;
    const THREADS: usize = 50;
    const OPS: usize = 1000;

    let (pool, factory) = pool_with(CAPACITY, BlockingPolicy::Wait);
    let client = StoreClient::new(pool.clone());

    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let pool = pool.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                let stats = pool.stats();
                assert!(stats.total() <= CAPACITY, "pool over capacity: {stats:?}");
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..OPS {
                    let key = format!("key-{t}-{i}");
                    client.set(&key, &key).expect("set");
                    assert_eq!(client.get(&key).expect("get"), key);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
    done.store(true, Ordering::SeqCst);
    observer.join().expect("observer");

    assert!(factory.connects() <= CAPACITY as u64);
    let stats = pool.stats();
    assert_eq!(stats.checked_out, 0);
    assert!(stats.idle <= CAPACITY);
}
