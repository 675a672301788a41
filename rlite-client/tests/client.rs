use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rlite_client::{ClientConfig, ClientError, Command, KVClient, Reply};

fn spawn_server(expected_commands: usize, handler: fn(usize, Vec<Vec<u8>>, &mut TcpStream)) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let args = read_command(&mut reader).expect("read command");
            handler(idx, args, &mut stream);
        }
    });

    port
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn write_raw(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(data);
    let _ = stream.flush();
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("+{}\r\n", msg).as_bytes());
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(format!("${}\r\n", data.len()).as_bytes());
    let _ = stream.write_all(data);
    write_raw(stream, b"\r\n");
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    write_raw(stream, format!(":{}\r\n", value).as_bytes());
}

fn config_for(port: u16) -> ClientConfig {
    let mut config = ClientConfig::new("127.0.0.1");
    config.port = port;
    config.pool_size = 1;
    config.connect_timeout = Some(Duration::from_secs(1));
    config.send_timeout = Some(Duration::from_secs(1));
    config.receive_timeout = Some(Duration::from_secs(2));
    config
}

fn client_for(port: u16) -> KVClient {
    KVClient::with_config(config_for(port)).expect("client")
}

#[test]
fn client_set_get_roundtrip() {
    let port = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args, vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
            write_simple(stream, "OK");
        } else {
            assert_eq!(args, vec![b"GET".to_vec(), b"key".to_vec()]);
            write_bulk(stream, b"value");
        }
    });

    let client = client_for(port);
    client.set(b"key", b"value").expect("set");
    assert_eq!(client.get(b"key").expect("get"), Some(b"value".to_vec()));
}

#[test]
fn missing_key_is_none() {
    let port = spawn_server(1, |_, _, stream| write_raw(stream, b"$-1\r\n"));

    let client = client_for(port);
    assert_eq!(client.get_string("absent").expect("get"), None);
}

#[test]
fn client_exists_and_delete() {
    let port = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args, vec![b"EXISTS".to_vec(), b"key".to_vec()]);
            write_integer(stream, 1);
        }
        1 => {
            assert_eq!(args, vec![b"DEL".to_vec(), b"key".to_vec()]);
            write_integer(stream, 1);
        }
        _ => {
            assert_eq!(args[0], b"DEL");
            write_integer(stream, 0);
        }
    });

    let client = client_for(port);
    assert_eq!(client.exists(b"key").expect("exists"), 1);
    assert!(client.del(b"key").expect("del"));
    assert!(!client.del(b"key").expect("del again"));
}

#[test]
fn server_error_strips_err_prefix() {
    let port = spawn_server(2, |idx, _, stream| {
        if idx == 0 {
            write_raw(stream, b"-ERR unknown command\r\n");
        } else {
            write_simple(stream, "PONG");
        }
    });

    let client = client_for(port);
    let err = client.execute(&Command::new(b"FROB").arg(&b"x"[..])).unwrap_err();
    assert_eq!(err.server_message(), Some("unknown command"));
    // An error reply leaves the connection usable.
    assert!(client.ping().expect("ping"));
}

#[test]
fn bad_bulk_terminator_is_protocol_error_with_context() {
    let port = spawn_server(1, |_, _, stream| write_raw(stream, b"$5\r\nvalueXX"));

    let client = client_for(port);
    match client.get(b"key") {
        Err(ClientError::Protocol { message, port, command }) => {
            assert_eq!(message, "invalid termination");
            assert_ne!(port, 0);
            assert_eq!(command, "GET key");
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[test]
fn unexpected_leading_byte_is_protocol_error() {
    let port = spawn_server(1, |_, _, stream| write_raw(stream, b"?what\r\n"));

    let err = client_for(port).get(b"key").unwrap_err();
    assert!(err.is_protocol());
    assert!(err.to_string().contains("unexpected reply: ?what"));
}

#[test]
fn truncated_reply_is_protocol_error() {
    let port = spawn_server(1, |_, _, stream| {
        write_raw(stream, b"$10\r\nabc");
        let _ = stream.shutdown(std::net::Shutdown::Write);
    });

    let err = client_for(port).get(b"key").unwrap_err();
    assert!(err.is_protocol(), "got {:?}", err);
}

#[test]
fn wrong_reply_kind_is_protocol_error() {
    let port = spawn_server(1, |_, _, stream| write_integer(stream, 7));

    let err = client_for(port).get(b"key").unwrap_err();
    assert!(err.is_protocol());
    assert!(err.to_string().contains("unexpected integer reply"));
}

#[test]
fn execute_returns_nested_and_null_arrays() {
    let port = spawn_server(2, |idx, _, stream| {
        if idx == 0 {
            write_raw(stream, b"*3\r\n:1\r\n*2\r\n$1\r\na\r\n$-1\r\n+done\r\n");
        } else {
            write_raw(stream, b"*-1\r\n");
        }
    });

    let client = client_for(port);
    let reply = client.execute(&Command::new(b"CUSTOM")).expect("nested");
    assert_eq!(
        reply,
        Reply::Array(vec![
            Reply::Integer(1),
            Reply::Array(vec![Reply::Bulk(Some(b"a".to_vec())), Reply::Bulk(None)]),
            Reply::Simple("done".to_string()),
        ])
    );
    assert_eq!(client.execute(&Command::new(b"CUSTOM")).expect("null"), Reply::Array(Vec::new()));
}

#[test]
fn oversized_value_is_rejected_without_connecting() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let port = listener.local_addr().expect("addr").port();

    let mut config = config_for(port);
    config.max_value_len = 8;
    let client = KVClient::with_config(config).expect("client");

    let err = client.set(b"key", b"0123456789").unwrap_err();
    assert!(err.is_argument());
    let err = client.mset(&[(&b"a"[..], &b"ok"[..]), (&b"b"[..], &b"0123456789"[..])]).unwrap_err();
    assert!(err.is_argument());

    thread::sleep(Duration::from_millis(50));
    assert!(listener.accept().is_err(), "no connection should have been opened");
}

#[test]
fn connection_is_reused_across_commands() {
    static ACCEPTED: AtomicUsize = AtomicUsize::new(0);

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            ACCEPTED.fetch_add(1, Ordering::SeqCst);
            let mut writer = stream.try_clone().expect("clone");
            let mut reader = BufReader::new(stream);
            while read_command(&mut reader).is_ok() {
                write_simple(&mut writer, "PONG");
            }
        }
    });

    let client = client_for(port);
    for _ in 0..5 {
        assert!(client.ping().expect("ping"));
    }
    assert_eq!(ACCEPTED.load(Ordering::SeqCst), 1);
}
