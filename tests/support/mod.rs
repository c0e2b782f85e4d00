//! In-process test harness: a real server on an ephemeral port and a raw
//! SMTP client speaking CRLF over the socket.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    task::JoinHandle,
};
use unmta::{
    config::Unfig,
    error::ServerError,
    plugin::{Plugin, PluginManager},
    server::{Server, ShutdownHandle},
};

pub struct TestServer {
    pub addr: SocketAddr,
    handle: ShutdownHandle,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn start(config: Unfig, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut manager = PluginManager::default();
        manager.load_plugins(plugins).unwrap();

        let bound = Server::new(config, manager).bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        let handle = bound.shutdown_handle();
        let task = tokio::spawn(bound.serve());

        Self { addr, handle, task }
    }

    pub async fn connect(&self) -> Client<TcpStream> {
        Client::new(TcpStream::connect(self.addr).await.unwrap())
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}

/// Server config pointing at loopback with test-friendly timeouts.
pub fn test_config() -> Unfig {
    let mut config = Unfig::default();
    config.smtp.listen = "127.0.0.1".to_string();
    config.smtp.port = 0;
    config.smtp.hostname = "mx.test.example".to_string();
    config.smtp.inactivity_timeout = 5;
    config.smtp.graceful_stop_timeout = 2;
    config
}

pub struct Client<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    /// Reassemble the stream, e.g. to hand it to a TLS connector. Any
    /// buffered read-ahead is discarded, so only call this at a quiet point
    /// in the conversation.
    pub fn into_inner(self) -> S {
        self.reader.into_inner().unsplit(self.writer)
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Read one (possibly multiline) reply. `None` when the server closed
    /// the connection.
    pub async fn read_reply(&mut self) -> Option<(u16, Vec<String>)> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(
                Duration::from_secs(10),
                self.reader.read_line(&mut line),
            )
            .await
            .expect("timed out waiting for a reply")
            .ok()?;

            if read == 0 {
                return None;
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            let code: u16 = trimmed.get(..3)?.parse().ok()?;

            match trimmed.as_bytes().get(3) {
                Some(b'-') => lines.push(trimmed[4..].to_string()),
                Some(b' ') => {
                    lines.push(trimmed[4..].to_string());
                    return Some((code, lines));
                }
                // Bare "250" with no text
                _ => {
                    lines.push(String::new());
                    return Some((code, lines));
                }
            }
        }
    }

    pub async fn expect(&mut self, code: u16) -> Vec<String> {
        let (got, lines) = self
            .read_reply()
            .await
            .unwrap_or_else(|| panic!("connection closed while expecting {code}"));
        assert_eq!(got, code, "unexpected reply {got}: {lines:?}");
        lines
    }

    /// True once the server has closed the connection.
    pub async fn closed(&mut self) -> bool {
        self.read_reply().await.is_none()
    }
}

/// Poll until `predicate` holds or two seconds elapse.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
