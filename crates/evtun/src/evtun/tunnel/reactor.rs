//! Readiness plumbing between local sockets and the session task.
//!
//! Every local socket gets a small task that waits on it and reports what happened as an
//! [`Event`] on one bounded channel. The session task is the only consumer, so the listener
//! and child tables are only ever touched from one place.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
};

use crate::evtun::tunnel::frame::{EndpointId, wire_peer};

pub const EVENT_QUEUE: usize = 1024;
/// Largest read from an accepted TCP connection.
pub const RECV_MAX: usize = 8192;
/// Receive buffer for one UDP datagram.
pub const DATAGRAM_MAX: usize = 65535;
/// Pause before accepting again when the process ran out of descriptors or memory.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum Event {
    /// A TCP listener accepted a connection.
    Accepted {
        endpoint: EndpointId,
        peer: SocketAddr,
        stream: TcpStream,
    },
    /// Bytes read from a TCP child or a datagram received on a UDP listener.
    Data {
        endpoint: EndpointId,
        peer: SocketAddr,
        payload: Bytes,
    },
    /// A TCP child hit EOF (`err` is `None`) or failed.
    Closed {
        endpoint: EndpointId,
        peer: SocketAddr,
        err: Option<io::Error>,
    },
    /// The listening socket itself failed and stopped serving.
    ListenerFailed { endpoint: EndpointId, err: io::Error },
}

/// Owned background task, aborted when dropped.
#[derive(Debug)]
pub struct Task(JoinHandle<()>);

impl Drop for Task {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Reactor {
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE)
    }

    pub fn with_capacity(n: usize) -> Self {
        let (tx, rx) = mpsc::channel(n.max(1));
        Self { tx, rx }
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            tx: self.tx.clone(),
        }
    }

    /// Waits for the next event. Never returns `None` while `self` is alive since it
    /// keeps a sender of its own.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}

/// Spawns the per-socket tasks feeding a [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    tx: mpsc::Sender<Event>,
}

impl ReactorHandle {
    pub fn spawn_accept(&self, endpoint: EndpointId, ln: TcpListener) -> Task {
        let tx = self.tx.clone();
        Task(tokio::spawn(async move {
            loop {
                let ev = match ln.accept().await {
                    Ok((stream, peer)) => Event::Accepted {
                        endpoint,
                        peer: wire_peer(peer),
                        stream,
                    },
                    Err(err) => {
                        if let Some(delay) = accept_retry_delay(&err) {
                            tracing::warn!(endpoint = %endpoint, err = %err, "tunnel: accept failed; retrying");
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            continue;
                        }
                        let _ = tx.send(Event::ListenerFailed { endpoint, err }).await;
                        return;
                    }
                };
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        }))
    }

    pub fn spawn_reader(&self, endpoint: EndpointId, peer: SocketAddr, mut rd: OwnedReadHalf) -> Task {
        let tx = self.tx.clone();
        Task(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_MAX];
            loop {
                let ev = match rd.read(&mut buf).await {
                    Ok(0) => Event::Closed {
                        endpoint,
                        peer,
                        err: None,
                    },
                    Ok(n) => Event::Data {
                        endpoint,
                        peer,
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    },
                    Err(err) => Event::Closed {
                        endpoint,
                        peer,
                        err: Some(err),
                    },
                };
                let last = matches!(ev, Event::Closed { .. });
                if tx.send(ev).await.is_err() || last {
                    return;
                }
            }
        }))
    }

    /// Drains `queue` into the write half. The task ends when the queue's sender is dropped.
    pub fn spawn_writer(
        &self,
        endpoint: EndpointId,
        peer: SocketAddr,
        mut wr: OwnedWriteHalf,
        mut queue: mpsc::UnboundedReceiver<Bytes>,
    ) -> Task {
        let tx = self.tx.clone();
        Task(tokio::spawn(async move {
            while let Some(b) = queue.recv().await {
                if let Err(err) = wr.write_all(&b).await {
                    let _ = tx
                        .send(Event::Closed {
                            endpoint,
                            peer,
                            err: Some(err),
                        })
                        .await;
                    return;
                }
            }
            let _ = wr.shutdown().await;
        }))
    }

    pub fn spawn_datagrams(&self, endpoint: EndpointId, sock: Arc<UdpSocket>) -> Task {
        let tx = self.tx.clone();
        Task(tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_MAX];
            loop {
                let ev = match sock.recv_from(&mut buf).await {
                    Ok((n, peer)) => Event::Data {
                        endpoint,
                        peer: wire_peer(peer),
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    },
                    // ICMP unreachable from an earlier send_to; not fatal for the socket.
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                        ) =>
                    {
                        tracing::debug!(endpoint = %endpoint, err = %err, "tunnel: udp recv error ignored");
                        continue;
                    }
                    Err(err) => Event::ListenerFailed { endpoint, err },
                };
                let last = matches!(ev, Event::ListenerFailed { .. });
                if tx.send(ev).await.is_err() || last {
                    return;
                }
            }
        }))
    }
}

/// How long to wait before the next `accept` after `err`, or `None` when the listening
/// socket itself is broken.
///
/// Aborted handshakes concern one incoming connection only. Descriptor or memory
/// exhaustion passes once other connections go away.
fn accept_retry_delay(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => return Some(Duration::ZERO),
        io::ErrorKind::OutOfMemory => return Some(ACCEPT_BACKOFF),
        _ => {}
    }
    // ENFILE / EMFILE
    match err.raw_os_error() {
        Some(23 | 24) if cfg!(unix) => Some(ACCEPT_BACKOFF),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(r: &mut Reactor) -> Event {
        tokio::time::timeout(Duration::from_secs(5), r.next())
            .await
            .expect("event timeout")
            .expect("reactor closed")
    }

    #[tokio::test]
    async fn tcp_accept_read_and_eof() {
        let mut r = Reactor::new();
        let h = r.handle();
        let ep = EndpointId::tcp(1);

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let _accept = h.spawn_accept(ep, ln);

        let mut c = TcpStream::connect(addr).await.unwrap();
        let local = c.local_addr().unwrap();

        let (stream, peer) = match next(&mut r).await {
            Event::Accepted { endpoint, peer, stream } => {
                assert_eq!(endpoint, ep);
                (stream, peer)
            }
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(peer, local);

        let (rd, wr) = stream.into_split();
        let _reader = h.spawn_reader(ep, peer, rd);
        let (qtx, qrx) = mpsc::unbounded_channel();
        let _writer = h.spawn_writer(ep, peer, wr, qrx);

        c.write_all(b"ping").await.unwrap();
        match next(&mut r).await {
            Event::Data { payload, .. } => assert_eq!(&payload[..], b"ping"),
            other => panic!("unexpected event: {other:?}"),
        }

        qtx.send(Bytes::from_static(b"pong")).unwrap();
        let mut got = [0u8; 4];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        drop(c);
        match next(&mut r).await {
            Event::Closed { peer: p, err, .. } => {
                assert_eq!(p, peer);
                assert!(err.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn udp_datagrams_are_reported_with_source() {
        let mut r = Reactor::new();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let _task = r.handle().spawn_datagrams(EndpointId::udp(addr.port()), sock);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"dgram", addr).await.unwrap();

        match next(&mut r).await {
            Event::Data { endpoint, peer, payload } => {
                assert_eq!(endpoint, EndpointId::udp(addr.port()));
                assert_eq!(peer, client.local_addr().unwrap());
                assert_eq!(&payload[..], b"dgram");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn accept_errors_for_one_connection_are_retried() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert_eq!(accept_retry_delay(&kind.into()), Some(Duration::ZERO), "{kind:?}");
        }
        assert_eq!(accept_retry_delay(&io::ErrorKind::OutOfMemory.into()), Some(ACCEPT_BACKOFF));
        #[cfg(unix)]
        assert_eq!(accept_retry_delay(&io::Error::from_raw_os_error(24)), Some(ACCEPT_BACKOFF));
    }

    #[test]
    fn broken_listening_socket_is_not_retried() {
        assert_eq!(accept_retry_delay(&io::ErrorKind::InvalidInput.into()), None);
        assert_eq!(accept_retry_delay(&io::Error::other("gone")), None);
        #[cfg(unix)]
        assert_eq!(accept_retry_delay(&io::Error::from_raw_os_error(9)), None); // EBADF
    }

    #[tokio::test]
    async fn dropping_task_releases_listener() {
        let r = Reactor::new();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let task = r.handle().spawn_accept(EndpointId::tcp(addr.port()), ln);
        drop(task);

        let refused = async {
            loop {
                if TcpStream::connect(addr).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), refused)
            .await
            .expect("listener still accepting");
    }
}
