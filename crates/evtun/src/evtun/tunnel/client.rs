use std::time::Duration;

use crate::evtun::tunnel::session::{self, SessionError, SessionOptions};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub metadata: serde_json::Value,
    pub reconnect_interval: Duration,
    /// Zero leaves connect attempts to the OS timeout.
    pub connect_timeout: Duration,
    pub session: SessionOptions,
}

/// Keeps one session alive against the server, reconnecting forever.
pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        opts.server_addr = opts.server_addr.trim().to_string();
        if opts.server_addr.is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.reconnect_interval.is_zero() {
            opts.reconnect_interval = DEFAULT_RECONNECT_INTERVAL;
        }
        Ok(Self { opts })
    }

    /// Runs until `shutdown` becomes true. Session failures never end the loop; the next
    /// attempt starts after the fixed reconnect interval (no backoff).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let interval = self.opts.reconnect_interval;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_connection_refused() => {
                    tracing::info!(
                        server=%self.opts.server_addr,
                        err=%err,
                        "tunnel: connection refused"
                    );
                }
                Err(SessionError::Disconnected) => {
                    tracing::info!(server=%self.opts.server_addr, "tunnel: closed");
                }
                Err(err) => {
                    tracing::warn!(
                        server=%self.opts.server_addr,
                        err=%err,
                        "tunnel: session failed"
                    );
                }
            }

            tracing::info!(
                server=%self.opts.server_addr,
                interval=%humantime::format_duration(interval),
                "tunnel: reconnecting"
            );

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn run_once(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), SessionError> {
        let stream = session::connect(&self.opts.server_addr, self.opts.connect_timeout).await?;
        tracing::info!(server=%self.opts.server_addr, "tunnel: connected");
        session::run_session(
            stream,
            &self.opts.metadata,
            self.opts.session.clone(),
            shutdown,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    fn opts(server_addr: String, interval: Duration) -> ClientOptions {
        ClientOptions {
            server_addr,
            metadata: json!({"site": "lab", "n": 1}),
            reconnect_interval: interval,
            connect_timeout: Duration::from_secs(5),
            session: SessionOptions::default(),
        }
    }

    async fn read_handshake(server: &TcpListener) -> (BufReader<TcpStream>, String) {
        let (conn, _) = server.accept().await.unwrap();
        let mut conn = BufReader::new(conn);
        let mut line = String::new();
        conn.read_line(&mut line).await.unwrap();
        (conn, line)
    }

    #[test]
    fn new_requires_server_and_defaults_interval() {
        assert!(Client::new(opts("  ".into(), Duration::ZERO)).is_err());
        let c = Client::new(opts(" 127.0.0.1:9000 ".into(), Duration::ZERO)).unwrap();
        assert_eq!(c.opts.server_addr, "127.0.0.1:9000");
        assert_eq!(c.opts.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
    }

    #[tokio::test]
    async fn reconnects_after_drop_with_same_metadata() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let client = Client::new(opts(addr, DEFAULT_RECONNECT_INTERVAL)).unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(rx).await });

        let (mut first, hello1) = read_handshake(&server).await;
        first
            .get_mut()
            .write_all(format!("{{\"type\":\"binary\",\"bind\":[{{\"protocol\":6,\"port\":{port}}}]}}\n").as_bytes())
            .await
            .unwrap();
        let bound = async {
            while TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), bound).await.unwrap();

        let dropped_at = tokio::time::Instant::now();
        drop(first);

        let (_second, hello2) = tokio::time::timeout(Duration::from_secs(5), read_handshake(&server))
            .await
            .expect("no reconnect");
        assert!(dropped_at.elapsed() < DEFAULT_RECONNECT_INTERVAL * 3);
        assert_eq!(hello1, hello2);
        let md: serde_json::Value = serde_json::from_str(hello2.trim_end()).unwrap();
        assert_eq!(md, json!({"site": "lab", "n": 1}));

        // The first session's listener was released before reconnecting.
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_retrying_refused_server_until_shutdown() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = Client::new(opts(format!("127.0.0.1:{port}"), Duration::from_millis(20))).unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
