//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them against an
//! in-memory keyspace with a fixed number of logical databases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{
    resp_bulk, resp_error, resp_integer, resp_null, resp_raw_error, resp_simple, RespError, RespParser,
};

/// Number of logical databases addressable through `SELECT`.
pub const DATABASES: usize = 16;

/// Keyspace and connection bookkeeping shared by every session.
pub struct Shared {
    dbs: Vec<Mutex<HashMap<Vec<u8>, Bytes>>>,
    password: Option<String>,
    accepted: AtomicUsize,
}

impl Shared {
    pub fn new(password: Option<String>) -> Self {
        Shared {
            dbs: (0..DATABASES).map(|_| Mutex::new(HashMap::new())).collect(),
            password,
            accepted: AtomicUsize::new(0),
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn get(&self, db: usize, key: &[u8]) -> Option<Bytes> {
        self.dbs.get(db)?.lock().get(key).cloned()
    }
}

struct Session {
    db: usize,
    authenticated: bool,
}

struct Outcome {
    reply: Vec<u8>,
    close: bool,
}

impl Outcome {
    fn reply(reply: Vec<u8>) -> Self {
        Outcome { reply, close: false }
    }
}

/// Accepts connections until the runtime shuts down.
pub async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, kick: broadcast::Sender<()>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        shared.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, "connection accepted");

        let shared = shared.clone();
        let kicked = kick.subscribe();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, shared, kicked).await {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}

/// Handles a single TCP client connection.
///
/// The connection is dropped without a reply when `kicked` fires.
pub async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut kicked: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut session = Session {
        db: 0,
        authenticated: shared.password.is_none(),
    };

    loop {
        let bytes = tokio::select! {
            read = stream.read_buf(&mut buffer) => read?,
            _ = kicked.recv() => return Ok(()),
        };
        if bytes == 0 {
            break;
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    let outcome = dispatch_command(&args, &shared, &mut session);
                    stream.write_all(&outcome.reply).await?;
                    if outcome.close {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    stream.write_all(&resp_error("protocol error")).await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

fn dispatch_command(args: &[Vec<u8>], shared: &Shared, session: &mut Session) -> Outcome {
    if args.is_empty() {
        return Outcome::reply(resp_error("empty command"));
    }

    let cmd = &args[0];
    if cmd.eq_ignore_ascii_case(b"QUIT") {
        return Outcome {
            reply: resp_simple("OK"),
            close: true,
        };
    }
    if cmd.eq_ignore_ascii_case(b"AUTH") {
        return Outcome::reply(handle_auth(args, shared, session));
    }
    if !session.authenticated {
        return Outcome::reply(resp_raw_error("NOAUTH Authentication required."));
    }

    let reply = if cmd.eq_ignore_ascii_case(b"PING") {
        handle_ping(args)
    } else if cmd.eq_ignore_ascii_case(b"ECHO") {
        handle_echo(args)
    } else if cmd.eq_ignore_ascii_case(b"SELECT") {
        handle_select(args, session)
    } else if cmd.eq_ignore_ascii_case(b"GET") {
        handle_get(args, shared, session)
    } else if cmd.eq_ignore_ascii_case(b"SET") {
        handle_set(args, shared, session)
    } else if cmd.eq_ignore_ascii_case(b"MSET") {
        handle_mset(args, shared, session)
    } else if cmd.eq_ignore_ascii_case(b"DEL") {
        handle_del(args, shared, session)
    } else if cmd.eq_ignore_ascii_case(b"EXISTS") {
        handle_exists(args, shared, session)
    } else {
        resp_error("unknown command")
    };
    Outcome::reply(reply)
}

fn handle_auth(args: &[Vec<u8>], shared: &Shared, session: &mut Session) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for AUTH");
    }
    match &shared.password {
        None => resp_error("Client sent AUTH, but no password is set"),
        Some(password) if password.as_bytes() == args[1].as_slice() => {
            session.authenticated = true;
            resp_simple("OK")
        }
        Some(_) => resp_error("invalid password"),
    }
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => resp_error("wrong number of arguments for PING"),
    }
}

fn handle_echo(args: &[Vec<u8>]) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for ECHO");
    }
    resp_bulk(&args[1])
}

fn handle_select(args: &[Vec<u8>], session: &mut Session) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for SELECT");
    }
    match parse_u64(&args[1]) {
        Ok(db) if (db as usize) < DATABASES => {
            session.db = db as usize;
            resp_simple("OK")
        }
        Ok(_) => resp_error("DB index is out of range"),
        Err(resp) => resp,
    }
}

fn handle_get(args: &[Vec<u8>], shared: &Shared, session: &Session) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GET");
    }
    match shared.get(session.db, &args[1]) {
        Some(value) => resp_bulk(&value),
        None => resp_null(),
    }
}

fn handle_set(args: &[Vec<u8>], shared: &Shared, session: &Session) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for SET");
    }
    shared.dbs[session.db]
        .lock()
        .insert(args[1].clone(), Bytes::copy_from_slice(&args[2]));
    resp_simple("OK")
}

fn handle_mset(args: &[Vec<u8>], shared: &Shared, session: &Session) -> Vec<u8> {
    if args.len() < 3 || args.len() % 2 == 0 {
        return resp_error("wrong number of arguments for MSET");
    }
    let mut db = shared.dbs[session.db].lock();
    for pair in args[1..].chunks_exact(2) {
        db.insert(pair[0].clone(), Bytes::copy_from_slice(&pair[1]));
    }
    resp_simple("OK")
}

fn handle_del(args: &[Vec<u8>], shared: &Shared, session: &Session) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for DEL");
    }
    let mut db = shared.dbs[session.db].lock();
    let removed = args[1..].iter().filter(|key| db.remove(key.as_slice()).is_some()).count();
    resp_integer(removed as i64)
}

fn handle_exists(args: &[Vec<u8>], shared: &Shared, session: &Session) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for EXISTS");
    }
    let db = shared.dbs[session.db].lock();
    let found = args[1..].iter().filter(|key| db.contains_key(key.as_slice())).count();
    resp_integer(found as i64)
}

fn parse_u64(arg: &[u8]) -> Result<u64, Vec<u8>> {
    if arg.is_empty() {
        return Err(resp_error("invalid integer"));
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(resp_error("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    fn run(shared: &Shared, session: &mut Session, parts: &[&str]) -> Vec<u8> {
        dispatch_command(&command(parts), shared, session).reply
    }

    #[test]
    fn databases_are_isolated() {
        let shared = Shared::new(None);
        let mut session = Session {
            db: 0,
            authenticated: true,
        };

        assert_eq!(run(&shared, &mut session, &["SET", "k", "zero"]), b"+OK\r\n");
        assert_eq!(run(&shared, &mut session, &["select", "3"]), b"+OK\r\n");
        assert_eq!(run(&shared, &mut session, &["GET", "k"]), b"$-1\r\n");
        assert_eq!(run(&shared, &mut session, &["SET", "k", "three"]), b"+OK\r\n");
        assert_eq!(shared.get(0, b"k").as_deref(), Some(&b"zero"[..]));
        assert_eq!(shared.get(3, b"k").as_deref(), Some(&b"three"[..]));
    }

    #[test]
    fn password_gates_commands_until_auth() {
        let shared = Shared::new(Some("secret".to_string()));
        let mut session = Session {
            db: 0,
            authenticated: false,
        };

        assert!(run(&shared, &mut session, &["PING"]).starts_with(b"-NOAUTH"));
        assert!(run(&shared, &mut session, &["AUTH", "wrong"]).starts_with(b"-ERR"));
        assert_eq!(run(&shared, &mut session, &["AUTH", "secret"]), b"+OK\r\n");
        assert_eq!(run(&shared, &mut session, &["PING"]), b"+PONG\r\n");
    }

    #[test]
    fn del_and_exists_count_keys() {
        let shared = Shared::new(None);
        let mut session = Session {
            db: 0,
            authenticated: true,
        };

        run(&shared, &mut session, &["MSET", "a", "1", "b", "2"]);
        assert_eq!(run(&shared, &mut session, &["EXISTS", "a", "b", "c"]), b":2\r\n");
        assert_eq!(run(&shared, &mut session, &["DEL", "a", "c"]), b":1\r\n");
        assert_eq!(run(&shared, &mut session, &["MSET", "a"]), resp_error("wrong number of arguments for MSET"));
    }

    #[test]
    fn quit_closes_and_unknown_is_rejected() {
        let shared = Shared::new(None);
        let mut session = Session {
            db: 0,
            authenticated: true,
        };

        let outcome = dispatch_command(&command(&["QUIT"]), &shared, &mut session);
        assert!(outcome.close);
        assert_eq!(run(&shared, &mut session, &["FLUSHALL"]), b"-ERR unknown command\r\n");
        assert_eq!(run(&shared, &mut session, &["SELECT", "16"]), b"-ERR DB index is out of range\r\n");
    }
}
