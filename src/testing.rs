//! In-process RESP server for connection tests.
//!
//! Speaks just enough of the protocol for the client handshake, `PING`,
//! `QUIT` and the subscription commands. Tests override individual replies
//! to hold, fail or drop a socket at a chosen point.

use crate::config::{RedisConnectionConfig, ServerConfig};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

/// How the server answers one command
pub(crate) enum Reply {
    Send(String),
    SendAfter(Duration, String),
    SendAndClose(String),
    Close,
}

type Handler = dyn Fn(&[String]) -> Option<Reply> + Send + Sync;

/// A fake Redis listening on an ephemeral localhost port
pub(crate) struct FakeRedis {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeRedis {
    /// Start a server; `handler` returning `None` falls back to
    /// [`default_reply`]
    pub(crate) async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Option<Reply> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Arc<Handler> = Arc::new(handler);
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        {
            let accepted = Arc::clone(&accepted);
            let open = Arc::clone(&open);
            let commands = Arc::clone(&commands);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    open.fetch_add(1, Ordering::SeqCst);
                    let handler = Arc::clone(&handler);
                    let open = Arc::clone(&open);
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        serve(stream, handler, commands).await;
                        open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }

        Self {
            addr,
            accepted,
            open,
            commands,
        }
    }

    pub(crate) fn redis_config(&self) -> RedisConnectionConfig {
        RedisConnectionConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..Default::default()
        }
    }

    /// Config whose global shard points at this server
    pub(crate) fn server_config(&self) -> ServerConfig {
        ServerConfig {
            redis: self.redis_config(),
            ..Default::default()
        }
    }

    /// Connections accepted so far
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Upper-cased command names in arrival order
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }

    /// Wait until every accepted socket has been closed by the client
    pub(crate) async fn wait_until_idle(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if self.open.load(Ordering::SeqCst) == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.open.load(Ordering::SeqCst) == 0
    }
}

/// Reply a real server would give for the commands the client sends
pub(crate) fn default_reply(command: &[String]) -> Reply {
    match command[0].to_uppercase().as_str() {
        "PING" => Reply::Send("+PONG\r\n".to_string()),
        "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" => {
            Reply::Send(subscription_reply(command))
        }
        _ => Reply::Send("+OK\r\n".to_string()),
    }
}

/// Confirmation push for a single-channel subscription command
pub(crate) fn subscription_reply(command: &[String]) -> String {
    let kind = command[0].to_lowercase();
    let channel = command.get(1).map(String::as_str).unwrap_or_default();
    format!(
        "*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n:1\r\n",
        kind.len(),
        kind,
        channel.len(),
        channel
    )
}

async fn serve(stream: TcpStream, handler: Arc<Handler>, commands: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(command) = read_command(&mut reader).await {
        let name = command[0].to_uppercase();
        commands.lock().unwrap().push(name.clone());

        let (bytes, close) = match handler(&command).unwrap_or_else(|| default_reply(&command)) {
            Reply::Send(bytes) => (bytes, false),
            Reply::SendAfter(delay, bytes) => {
                tokio::time::sleep(delay).await;
                (bytes, false)
            }
            Reply::SendAndClose(bytes) => (bytes, true),
            Reply::Close => return,
        };

        if write.write_all(bytes.as_bytes()).await.is_err() {
            return;
        }
        if close || name == "QUIT" {
            return;
        }
    }
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Some(args)
}
