use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use redius_client::{
    ClientError, ConnectionPool, Credential, ErrorMode, Limit, PoolConfig, ScoreBound,
    StoreClient,
};

type Received = Vec<Vec<String>>;

/// Accepts one connection and answers each command with the next scripted
/// reply. Returns the commands it saw once the script runs out, then hangs up.
fn spawn_server(replies: &[&'static [u8]]) -> (String, JoinHandle<Received>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let replies = replies.to_vec();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut received = Vec::new();
        for reply in replies {
            let args = read_command(&mut reader).expect("read command");
            received.push(
                args.into_iter()
                    .map(|arg| String::from_utf8(arg).expect("utf8 arg"))
                    .collect(),
            );
            stream.write_all(reply).expect("write reply");
            stream.flush().expect("flush");
        }
        received
    });

    (addr, handle)
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if &crlf != b"\r\n" {
            return Err(invalid("missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| invalid("bad length"))
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

fn config(addr: String) -> PoolConfig {
    let mut config = PoolConfig::tcp(addr, 1);
    config.read_timeout = Some(Duration::from_secs(2));
    config.write_timeout = Some(Duration::from_secs(2));
    config.connect_timeout = Some(Duration::from_secs(2));
    config
}

fn client(config: PoolConfig) -> StoreClient {
    StoreClient::new(ConnectionPool::new(config).expect("pool"))
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[test]
fn set_get_roundtrip_without_auth() {
    let (addr, server) = spawn_server(&[b"+OK\r\n", b"$5\r\nvalue\r\n"]);

    let client = client(config(addr));
    client.set("key", "value").expect("set");
    assert_eq!(client.get("key").expect("get"), "value");

    let received = server.join().expect("server");
    assert_eq!(
        received,
        vec![command(&["SET", "key", "value"]), command(&["GET", "key"])]
    );
}

#[test]
fn auth_is_sent_once_per_connection() {
    let (addr, server) = spawn_server(&[b"+OK\r\n", b"+OK\r\n", b"$-1\r\n", b"+PONG\r\n"]);

    let credential = Credential::new("s3cret").expect("credential");
    let client = client(config(addr).with_credential(credential));
    client.set("k", "v").expect("set");
    assert!(matches!(client.get("missing"), Err(ClientError::Nil)));
    assert_eq!(client.ping().expect("ping"), "PONG");

    let received = server.join().expect("server");
    assert_eq!(received[0], command(&["AUTH", "s3cret"]));
    assert_eq!(received.iter().filter(|cmd| cmd[0] == "AUTH").count(), 1);
    assert_eq!(received.len(), 4);
}

#[test]
fn rejected_auth_yields_no_connection() {
    let (addr, server) = spawn_server(&[
        b"-WRONGPASS invalid username-password pair or user is disabled.\r\n",
    ]);

    let credential = Credential::new("wrong").expect("credential");
    let client = client(config(addr).with_credential(credential));
    match client.ping() {
        Err(ClientError::AuthFailed { message }) => assert!(message.starts_with("WRONGPASS")),
        other => panic!("expected auth failure, got {other:?}"),
    }

    let stats = client.pool().stats();
    assert_eq!(stats.total(), 0);
    server.join().expect("server");
}

#[test]
fn hash_commands_marshal_fields_in_order() {
    let (addr, server) = spawn_server(&[
        b"+OK\r\n",
        b"*2\r\n$1\r\n1\r\n$-1\r\n",
        b"*2\r\n$1\r\n0\r\n*2\r\n$1\r\na\r\n$1\r\n1\r\n",
        b":1\r\n",
    ]);

    let client = client(config(addr));
    client.hmset("h", &[("a", "1"), ("b", "2")]).expect("hmset");
    assert_eq!(
        client.hmget("h", &["a", "x"]).expect("hmget"),
        vec![Some("1".to_string()), None]
    );
    let page = client.hscan("h", 0, "*", 10).expect("hscan");
    assert!(page.is_last());
    assert_eq!(page.items, vec!["a".to_string(), "1".to_string()]);
    client.hdel_all("h").expect("hdel_all");

    let received = server.join().expect("server");
    assert_eq!(
        received,
        vec![
            command(&["HMSET", "h", "a", "1", "b", "2"]),
            command(&["HMGET", "h", "a", "x"]),
            command(&["HSCAN", "h", "0", "MATCH", "*", "COUNT", "10"]),
            command(&["DEL", "h"]),
        ]
    );
}

#[test]
fn sorted_set_commands_render_bounds() {
    let (addr, server) = spawn_server(&[
        b":1\r\n",
        b"*4\r\n$1\r\nc\r\n$1\r\n3\r\n$1\r\nb\r\n$3\r\n2.5\r\n",
        b"*0\r\n",
        b"$3\r\n4.5\r\n",
    ]);

    let client = client(config(addr));
    assert!(client.zadd("z", 1.5, "m").expect("zadd"));
    let scored = client
        .zrevrange_by_score_with_scores(
            "z",
            ScoreBound::PosInf,
            ScoreBound::NegInf,
            Some(Limit::new(0, 2)),
        )
        .expect("zrevrange");
    assert_eq!(scored, vec![("c".to_string(), 3.0), ("b".to_string(), 2.5)]);
    let empty = client
        .zrange_by_score("z", ScoreBound::Exclusive(1.0), ScoreBound::Inclusive(3.0), None)
        .expect("zrange");
    assert!(empty.is_empty());
    assert_eq!(client.zincr_by("z", 3.0, "m").expect("zincrby"), 4.5);

    let received = server.join().expect("server");
    assert_eq!(
        received,
        vec![
            command(&["ZADD", "z", "1.5", "m"]),
            command(&["ZREVRANGEBYSCORE", "z", "+inf", "-inf", "WITHSCORES", "LIMIT", "0", "2"]),
            command(&["ZRANGEBYSCORE", "z", "(1", "3"]),
            command(&["ZINCRBY", "z", "3", "m"]),
        ]
    );
}

#[test]
fn key_commands_marshal_arguments() {
    let (addr, server) = spawn_server(&[
        b"+OK\r\n",
        b":2\r\n",
        b":1\r\n",
        b"*2\r\n$1\r\n7\r\n*1\r\n$5\r\nuser1\r\n",
        b":3\r\n",
        b"*2\r\n$1\r\nb\r\n$1\r\na\r\n",
    ]);

    let client = client(config(addr));
    client.set_ex("k", Duration::from_secs(30), "v").expect("set_ex");
    assert_eq!(client.del_all(&["a", "b", "c"]).expect("del_all"), 2);
    client.expire_at("k", 1_900_000_000).expect("expire_at");
    let page = client.scan(0, "user*", 5).expect("scan");
    assert_eq!(page.cursor, 7);
    assert_eq!(page.items, vec!["user1".to_string()]);
    assert_eq!(client.lpush("l", &["a", "b"]).expect("lpush"), 3);
    assert_eq!(client.lrange("l", 0, -1).expect("lrange"), vec!["b", "a"]);

    let received = server.join().expect("server");
    assert_eq!(
        received,
        vec![
            command(&["SETEX", "k", "30", "v"]),
            command(&["DEL", "a", "b", "c"]),
            command(&["EXPIREAT", "k", "1900000000"]),
            command(&["SCAN", "0", "MATCH", "user*", "COUNT", "5"]),
            command(&["LPUSH", "l", "a", "b"]),
            command(&["LRANGE", "l", "0", "-1"]),
        ]
    );
}

#[test]
fn server_errors_surface_verbatim_and_keep_the_connection() {
    let (addr, server) = spawn_server(&[
        b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
        b"$1\r\nv\r\n",
    ]);

    let client = client(config(addr));
    match client.hget("k", "f") {
        Err(ClientError::Server { message }) => assert_eq!(
            message,
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        ),
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(client.get("k").expect("get"), "v");

    server.join().expect("server");
}

#[test]
fn fire_and_forget_swallows_only_when_asked() {
    let (addr, server) = spawn_server(&[
        b"-ERR hash value is not an integer\r\n",
        b"-ERR hash value is not an integer\r\n",
    ]);

    let pool = ConnectionPool::new(config(addr)).expect("pool");
    let surfacing = StoreClient::new(pool.clone());
    let forgetting = StoreClient::new(pool).with_error_mode(ErrorMode::FireAndForget);

    assert!(matches!(
        surfacing.hincr_by("h", "f", 1),
        Err(ClientError::Server { .. })
    ));
    forgetting.hincr_by("h", "f", 1).expect("error is swallowed");

    server.join().expect("server");
}

#[test]
fn transport_failure_marks_connection_broken() {
    let (addr, server) = spawn_server(&[b"+OK\r\n"]);

    let mut config = config(addr);
    config.discard_broken = true;
    let client = client(config);
    client.set("k", "v").expect("set");
    server.join().expect("server");

    let err = client.get("k").unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err:?}");
    let stats = client.pool().stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.checked_out, 0);
}
