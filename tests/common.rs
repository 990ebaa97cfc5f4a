#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One scripted server action for a received request.
pub enum Step {
    /// Write these bytes to the client.
    Write(Vec<u8>),
    /// Pause this many milliseconds, ending the client's read turn.
    Sleep(u64),
    /// Read and discard exactly this many request-body bytes.
    ReadBody(usize),
    /// Close the connection.
    Close,
}

pub struct TestServer {
    addr: String,
    conns: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of TCP connections the server has accepted.
    pub fn connections(&self) -> usize {
        self.conns.load(Ordering::SeqCst)
    }
}

/// Serve scripted responses. The script closure is called per request with
/// (connection index, request index on that connection, request head) and
/// returns the steps to perform.
pub async fn serve<F>(script: F) -> io::Result<TestServer>
where
    F: Fn(usize, usize, &str) -> Vec<Step> + Send + Sync + 'static,
{
    setup_logger();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = format!("127.0.0.1:{}", listener.local_addr()?.port());

    let conns = Arc::new(AtomicUsize::new(0));
    let accepted = conns.clone();
    let script = Arc::new(script);

    tokio::spawn(async move {
        let mut conn_no = 0_usize;

        loop {
            let (mut tcp, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };

            accepted.fetch_add(1, Ordering::SeqCst);

            let conn_index = conn_no;
            conn_no += 1;

            let script = script.clone();

            tokio::spawn(async move {
                let mut req_no = 0_usize;

                loop {
                    let head = match read_head(&mut tcp).await {
                        Ok(Some(h)) => h,
                        _ => return,
                    };

                    let steps = script(conn_index, req_no, &head);
                    req_no += 1;

                    for step in steps {
                        match step {
                            Step::Write(data) => {
                                if tcp.write_all(&data).await.is_err() {
                                    return;
                                }
                                tcp.flush().await.ok();
                            }
                            Step::Sleep(ms) => {
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                            }
                            Step::ReadBody(amount) => {
                                let mut buf = vec![0_u8; amount];
                                if tcp.read_exact(&mut buf).await.is_err() {
                                    return;
                                }
                            }
                            Step::Close => return,
                        }
                    }
                }
            });
        }
    });

    Ok(TestServer { addr, conns })
}

/// Read a request head (through the final CRLFCRLF). None on EOF.
async fn read_head(tcp: &mut TcpStream) -> io::Result<Option<String>> {
    let mut buf = vec![];
    let mut one = [0_u8; 1];

    loop {
        let amount = tcp.read(&mut one).await?;

        if amount == 0 {
            return Ok(None);
        }

        buf.push(one[0]);

        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    Ok(Some(String::from_utf8_lossy(&buf).to_string()))
}

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);

        if test_log {
            tracing_subscriber::fmt()
                .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
                .init();
        }
    });
}

/// A response head plus body with the given content-length and body bytes.
pub fn response_with_body(body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Deterministic body pattern for order/integrity asserts.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
