//! Integration tests for graceful shutdown.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use common::{read_response, test_router, READ_TIMEOUT};
use server::Serve;

#[test]
fn stop_without_traffic() {
    let serve = Serve::start(test_router()).unwrap();
    let started = Instant::now();
    serve.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "stop took too long");
}

#[test]
fn responds_then_stops() {
    let serve = Serve::start(test_router()).unwrap();

    let mut conn = TcpStream::connect(serve.addr()).unwrap();
    conn.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let response = read_response(&mut conn);
    assert_eq!(response.status, 200);
    drop(conn);

    let started = Instant::now();
    serve.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "stop took too long");
}

#[test]
fn stop_closes_idle_keepalive_connections() {
    let serve = Serve::start(test_router()).unwrap();

    // Hold a keep-alive connection open across the shutdown.
    let mut conn = TcpStream::connect(serve.addr()).unwrap();
    conn.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let response = read_response(&mut conn);
    assert_eq!(response.header("Connection"), Some("keep-alive"));

    let started = Instant::now();
    serve.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "stop took too long");

    // The held socket must observe EOF once the server is gone.
    let mut tmp = [0u8; 16];
    assert_eq!(conn.read(&mut tmp).expect("expected EOF"), 0);
}

#[test]
fn stop_is_idempotent_across_handles() {
    let serve = Serve::start(test_router()).unwrap();
    let handle = serve.stop_handle();
    handle.stop();
    handle.stop();
    serve.stop().unwrap();
}
