//! End-to-end exchanges over real sockets.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;

use common::{read_response, test_router, READ_TIMEOUT};
use server::{Config, Serve};

fn start_server() -> Serve {
    Serve::start(test_router()).expect("server start")
}

fn connect(serve: &Serve) -> TcpStream {
    let stream = TcpStream::connect(serve.addr()).expect("connect");
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

#[test]
fn headers_echo() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body, b"Hello World!");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn chunked_unknown_length_body() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET /infinite HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));
    assert!(response.header("Content-Length").is_none());
    assert_eq!(response.body, b"Hello World!");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn keep_alive_reuses_connection() {
    let serve = start_server();
    let mut conn = connect(&serve);

    for _ in 0..2 {
        conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let response = read_response(&mut conn);
        assert_eq!(response.status, 200);
        assert_eq!(response.header("Connection"), Some("keep-alive"));
        let advisory = response.header("Keep-Alive").expect("keep-alive advisory");
        assert!(advisory.starts_with("timeout="), "got {advisory:?}");
        assert_eq!(response.body, b"Hello World!");
    }

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn gzip_on_the_fly() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET /compressed HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Encoding"), Some("gzip"));
    assert_eq!(response.header("Vary"), Some("Accept-Encoding"));
    assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));

    let mut decoder = flate2::read::GzDecoder::new(&response.body[..]);
    let mut plain = String::new();
    decoder.read_to_string(&mut plain).expect("gunzip body");
    assert_eq!(plain, "Hello World!");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn gzip_skipped_without_accept_encoding() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET /compressed HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 200);
    assert!(response.header("Content-Encoding").is_none());
    assert_eq!(response.body, b"Hello World!");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn set_cookie_single() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"POST /set-cookie HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 200);
    let cookie = response.header("Set-Cookie").expect("set-cookie header");
    assert!(cookie.starts_with("test=test;"), "got {cookie:?}");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn set_cookie_many() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"POST /set-cookie-many HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 200);
    let cookies: Vec<&str> = response.headers_all("Set-Cookie").collect();
    assert_eq!(cookies.len(), 2, "got {cookies:?}");
    assert!(cookies.iter().all(|c| c.ends_with("=test;")));

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn echo_sized_request_body() {
    let serve = start_server();
    let mut conn = connect(&serve);

    let payload = b"some posted payload bytes";
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    conn.write_all(request.as_bytes()).unwrap();
    conn.write_all(payload).unwrap();

    let response = read_response(&mut conn);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, payload);

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn echo_chunked_request_body() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n")
        .unwrap();
    // Body arrives in separate writes to exercise incremental decode.
    conn.write_all(b"6\r\nHello \r\n").unwrap();
    conn.write_all(b"6\r\nWorld!\r\n").unwrap();
    conn.write_all(b"0\r\n\r\n").unwrap();

    let response = read_response(&mut conn);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"Hello World!");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn path_arguments_are_captured() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET /args/hello-capture HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello-capture");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn unmatched_route_is_404() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET /no/such/route HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);
    assert_eq!(response.status, 404);
    assert_eq!(response.header("Content-Length"), Some("0"));

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn malformed_request_gets_400_and_close() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"COMPLETE GARBAGE\r\n\r\n").unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 400);
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(response.body.starts_with(b"<!DOCTYPE html>"));

    // The server closes the connection after a parse failure.
    let mut tmp = [0u8; 16];
    assert_eq!(conn.read(&mut tmp).expect("expected EOF"), 0);

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn http10_connection_closes_after_response() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    let response = read_response(&mut conn);

    assert!(response.status_line.starts_with("HTTP/1.0 200"));
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.body, b"Hello World!");

    let mut tmp = [0u8; 16];
    assert_eq!(conn.read(&mut tmp).expect("expected EOF"), 0);

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn simple_request_line_is_http10() {
    let serve = start_server();
    let mut conn = connect(&serve);

    conn.write_all(b"/\r\n\r\n").unwrap();
    let response = read_response(&mut conn);

    assert!(response.status_line.starts_with("HTTP/1.0 200"));
    assert_eq!(response.body, b"Hello World!");

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn overload_answers_429() {
    let mut config = Config::local();
    config.workers.threads = 1;
    config.workers.queue_depth = 0;
    let serve = Serve::start_with_config(config, test_router()).unwrap();
    let mut conn = connect(&serve);

    conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let response = read_response(&mut conn);

    assert_eq!(response.status, 429);
    assert_eq!(response.header("Content-Length"), Some("0"));
    assert!(response.body.is_empty());

    drop(conn);
    serve.stop().unwrap();
}

#[test]
fn unix_socket_exchange() {
    use std::os::unix::net::UnixStream;

    let path = std::env::temp_dir().join(format!("http-core-test-{}.sock", std::process::id()));
    let mut config = Config::default();
    config.listener.push(server::config::ListenerConfig {
        address: Some("127.0.0.1:0".parse().unwrap()),
        path: Some(path.clone()),
    });

    let serve = Serve::start_with_config(config, test_router()).unwrap();

    let mut conn = UnixStream::connect(&path).expect("unix connect");
    conn.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: local\r\n\r\n")
        .unwrap();
    let response = read_response(&mut conn);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"Hello World!");

    drop(conn);
    serve.stop().unwrap();
    let _ = std::fs::remove_file(&path);
}
