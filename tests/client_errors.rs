//! Error taxonomy: protocol violations, truncation, timeouts, limits.

use hpool::{Body, Client, Error, PoolConfig};
use std::time::Duration;

mod common;
use common::{response_with_body, serve, Step};

#[tokio::test]
async fn broken_chunked_taints_the_connection() {
    let server = serve(|conn, _, _| {
        if conn == 0 {
            // NB: malformed chunked.
            vec![Step::Write(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nHELLO".to_vec(),
            )]
        } else {
            vec![Step::Write(response_with_body(b"OK"))]
        }
    })
    .await
    .unwrap();

    let client = Client::new();

    let req = http::Request::get(server.uri("/path"))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("malformed body");
    assert_eq!(err.to_string(), "Unexpected char in chunk size: 'H'");

    // the tainted connection is never reused; the next request gets a
    // fresh one.
    let req = http::Request::get(server.uri("/path"))
        .body(Body::empty())
        .unwrap();

    let res = client.exchange(req).await.unwrap();
    assert_eq!(res.into_body(), b"OK");

    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn partial_response_head() {
    let server = serve(|_, _, _| {
        vec![
            Step::Write(b"HTTP/1.1 200 OK\r\nContent-Len".to_vec()),
            Step::Close,
        ]
    })
    .await
    .unwrap();

    let client = Client::new();

    let req = http::Request::get(server.uri("/path"))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("partial head");
    assert!(err.is_closed_before_completion());
}

#[tokio::test]
async fn partial_response_body_is_reported_with_counts() {
    let server = serve(|_, _, _| {
        // NB: content-length 10 and we send just "OK", then drop.
        vec![
            Step::Write(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nOK".to_vec()),
            Step::Close,
        ]
    })
    .await
    .unwrap();

    let client = Client::new();

    let req = http::Request::get(server.uri("/path"))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("partial body");

    // truncation may surface before or after devolution; either way the
    // limiter's message names the counts.
    assert_eq!(
        err.to_string(),
        "Partial body received 2 bytes and expected 10"
    );
}

#[tokio::test]
async fn stalled_server_is_a_read_timeout() {
    let server = serve(|_, _, _| vec![Step::Sleep(10_000), Step::Close])
        .await
        .unwrap();

    let client = Client::builder()
        .config(PoolConfig::default().with_read_timeout(Duration::from_millis(50)))
        .build();

    let req = http::Request::get(server.uri("/stall"))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("nothing ever arrives");
    assert!(matches!(err, Error::ReadTimeout));
    assert!(err.is_timeout());
}

#[tokio::test]
async fn stall_mid_body_is_a_read_timeout() {
    let server = serve(|_, _, _| {
        vec![
            Step::Write(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nOK".to_vec()),
            Step::Sleep(10_000),
            Step::Close,
        ]
    })
    .await
    .unwrap();

    let client = Client::builder()
        .config(PoolConfig::default().with_read_timeout(Duration::from_millis(50)))
        .build();

    let req = http::Request::get(server.uri("/stall"))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("body never finishes");
    assert!(matches!(err, Error::ReadTimeout));
}

#[tokio::test]
async fn oversized_body_is_rejected_with_the_limit() {
    let server = serve(|_, _, _| vec![Step::Write(response_with_body(&[b'x'; 64]))])
        .await
        .unwrap();

    let client = Client::builder()
        .config(PoolConfig::default().with_max_body_size(10))
        .build();

    let req = http::Request::get(server.uri("/big"))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("body over the cap");

    match err {
        Error::BodyTooLarge(limit) => assert_eq!(limit, 10),
        e => panic!("expected BodyTooLarge, got: {}", e),
    }
}

#[tokio::test]
async fn post_larger_than_content_length() {
    let server = serve(|_, _, _| vec![Step::Sleep(1_000)]).await.unwrap();

    let client = Client::new();

    let req = http::Request::post(server.uri("/path"))
        .header("content-length", 2)
        .body(Body::from("HELLO"))
        .unwrap();

    let err = client.exchange(req).await.expect_err("body over the promise");
    assert_eq!(
        err.to_string(),
        "Body data longer than content-length header: 5 > 2"
    );
}

#[tokio::test]
async fn acquire_timeout_when_connect_hangs() {
    // nothing listens to accept: connects to a port that was just closed.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::builder()
        .config(PoolConfig::default().with_acquire_timeout(Duration::from_millis(100)))
        .build();

    let req = http::Request::get(format!("http://127.0.0.1:{}/", addr.port()))
        .body(Body::empty())
        .unwrap();

    let err = client.exchange(req).await.expect_err("no server to reach");

    // connect failures surface to the caller only as an acquire timeout.
    assert!(matches!(err, Error::AcquireTimeout(_)));
}
