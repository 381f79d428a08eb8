//! Test harness: spin up a full server on an ephemeral port and talk to it
//! over real sockets.
#![allow(dead_code)]

use std::net::SocketAddr;

use mailforge::{Config, Server};
use mailforge_common::{Signal, events::EventBus};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

pub struct TestServer {
    pub addr: SocketAddr,
    pub events: EventBus,
    shutdown: tokio::sync::broadcast::Sender<Signal>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    /// Build, bind and serve a server from the given TOML.
    pub async fn start(toml: &str) -> Self {
        let config = Config::from_toml(toml).expect("test config must parse");
        Self::start_with(config).await
    }

    pub async fn start_with(config: Config) -> Self {
        let server = Server::from_config(config).expect("server must build");
        let events = server.events();
        let bound = server.bind().await.expect("server must bind");
        let addr = bound.local_addrs()[0];

        let (shutdown, _) = tokio::sync::broadcast::channel(8);
        let handle = tokio::spawn(bound.serve(shutdown.clone()));

        Self {
            addr,
            events,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        let _ = self.handle.await;
    }
}

/// A bare-bones SMTP test client speaking CRLF lines.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read one reply line (including the status code).
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read line");
        line.trim_end().to_string()
    }

    /// Read a complete (possibly multiline) reply.
    pub async fn read_reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.writer
            .write_all(data.as_bytes())
            .await
            .expect("write");
    }

    pub async fn send_line(&mut self, line: &str) {
        self.send(&format!("{line}\r\n")).await;
    }

    /// Send a command and read its reply.
    pub async fn cmd(&mut self, line: &str) -> Vec<String> {
        self.send_line(line).await;
        self.read_reply().await
    }

    /// Read until the peer closes the connection, returning everything.
    pub async fn read_to_end(&mut self) -> String {
        let mut out = String::new();
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return out,
                Ok(_) => out.push_str(&line),
            }
        }
    }
}

/// Assert a reply's status code.
pub fn assert_code(reply: &[String], code: u16) {
    let first = reply.first().expect("empty reply");
    assert!(
        first.starts_with(&code.to_string()),
        "expected {code}, got {first:?}"
    );
}
