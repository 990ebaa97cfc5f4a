//! Expect: 100-continue flows.

use hpool::{Body, Client};

mod common;
use common::{response_with_body, serve, Step};

#[tokio::test]
async fn expect_continue_sends_body_after_interim() {
    let server = serve(|_, req, head| {
        if req == 0 {
            assert!(head.contains("expect: 100-continue"));

            vec![
                Step::Write(b"HTTP/1.1 100 Continue\r\n\r\n".to_vec()),
                // exactly the promised body, exactly once.
                Step::ReadBody(5),
                Step::Write(response_with_body(b"stored")),
            ]
        } else {
            vec![Step::Write(response_with_body(b"OK"))]
        }
    })
    .await
    .unwrap();

    let client = Client::new();

    let req = http::Request::post(server.uri("/upload"))
        .header("expect", "100-continue")
        .body(Body::from("HELLO"))
        .unwrap();

    let res = client.exchange(req).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.into_body(), b"stored");

    // the exchange left no state behind: the connection is reused cleanly.
    let req = http::Request::get(server.uri("/after"))
        .body(Body::empty())
        .unwrap();

    let res = client.exchange(req).await.unwrap();
    assert_eq!(res.into_body(), b"OK");

    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn rejection_without_continue_skips_body() {
    let server = serve(|_, req, _| {
        if req == 0 {
            // reject immediately; never ask for the body.
            vec![Step::Write(
                b"HTTP/1.1 417 Expectation Failed\r\ncontent-length: 0\r\n\r\n".to_vec(),
            )]
        } else {
            vec![Step::Write(response_with_body(b"OK"))]
        }
    })
    .await
    .unwrap();

    let client = Client::new();

    let req = http::Request::post(server.uri("/upload"))
        .header("expect", "100-continue")
        .body(Body::from("HELLO"))
        .unwrap();

    // proxy: the status comes through verbatim.
    let res = client.proxy(req).await.unwrap();
    assert_eq!(res.status(), 417);

    // the request body was never sent, so that connection is done. a
    // fresh request opens a new one.
    let req = http::Request::get(server.uri("/after"))
        .body(Body::empty())
        .unwrap();

    let res = client.exchange(req).await.unwrap();
    assert_eq!(res.into_body(), b"OK");

    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn interim_with_content_is_discarded() {
    let server = serve(|_, _, _| {
        // a nonconforming interim with a small body before the real
        // response.
        vec![
            Step::Write(
                b"HTTP/1.1 100 Continue\r\ncontent-length: 3\r\n\r\nxxx".to_vec(),
            ),
            Step::ReadBody(5),
            Step::Write(response_with_body(b"done")),
        ]
    })
    .await
    .unwrap();

    let client = Client::new();

    let req = http::Request::post(server.uri("/upload"))
        .header("expect", "100-continue")
        .body(Body::from("HELLO"))
        .unwrap();

    let res = client.exchange(req).await.unwrap();
    assert_eq!(res.into_body(), b"done");
}
