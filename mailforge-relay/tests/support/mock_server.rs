//! Mock SMTP server for delivery tests: scripted per-recipient replies,
//! command capture, and a local port to point smart-host routing at.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Replies consumed one per RCPT TO; exhausted script means 250.
    pub rcpt_script: Vec<(u16, String)>,
    /// Reply after the end-of-data terminator.
    pub data_end: (u16, String),
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            rcpt_script: Vec::new(),
            data_end: (250, "Ok: queued".to_string()),
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    pub async fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let commands = Arc::new(Mutex::new(Vec::new()));

        let task_commands = Arc::clone(&commands);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let config = config.clone();
                let commands = Arc::clone(&task_commands);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, config, commands).await;
                });
            }
        });

        Self {
            addr,
            commands,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands mutex").clone()
    }

    pub fn received_command(&self, prefix: &str) -> bool {
        self.commands()
            .iter()
            .any(|c| c.to_ascii_uppercase().starts_with(prefix))
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: MockConfig,
    commands: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut rcpt_script: VecDeque<(u16, String)> = config.rcpt_script.into();

    write_half.write_all(b"220 mock ESMTP ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        commands.lock().expect("commands mutex").push(command.clone());

        let upper = command.to_ascii_uppercase();
        if upper.starts_with("EHLO") {
            write_half
                .write_all(b"250-mock greets you\r\n250-PIPELINING\r\n250 SIZE 10485760\r\n")
                .await?;
        } else if upper.starts_with("MAIL") {
            write_half.write_all(b"250 Ok\r\n").await?;
        } else if upper.starts_with("RCPT") {
            let (code, text) = rcpt_script
                .pop_front()
                .unwrap_or((250, "Ok".to_string()));
            write_half
                .write_all(format!("{code} {text}\r\n").as_bytes())
                .await?;
        } else if upper.starts_with("DATA") {
            write_half
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;

            // Consume the dot-stuffed body up to the terminator
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line.trim_end() == "." {
                    break;
                }
            }
            commands
                .lock()
                .expect("commands mutex")
                .push("<message body>".to_string());

            let (code, text) = &config.data_end;
            write_half
                .write_all(format!("{code} {text}\r\n").as_bytes())
                .await?;
        } else if upper.starts_with("QUIT") {
            write_half.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            write_half.write_all(b"250 Ok\r\n").await?;
        }
    }
}
