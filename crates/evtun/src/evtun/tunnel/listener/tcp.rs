use std::{collections::HashMap, io, net::SocketAddr};

use bytes::Bytes;
use tokio::{
    net::{TcpSocket, TcpStream},
    sync::mpsc,
};

use crate::evtun::tunnel::{
    frame::EndpointId,
    listener::ListenerError,
    reactor::{ReactorHandle, Task},
};

pub const BACKLOG: u32 = 5;

#[derive(Debug)]
struct Child {
    queue: mpsc::UnboundedSender<Bytes>,
    _reader: Task,
    _writer: Task,
}

/// Listening TCP socket plus the connections accepted on it, keyed by peer address.
#[derive(Debug)]
pub struct TcpBind {
    endpoint: EndpointId,
    local: SocketAddr,
    accept: Option<Task>,
    children: HashMap<SocketAddr, Child>,
}

impl TcpBind {
    pub fn bind(endpoint: EndpointId, addr: SocketAddr, reactor: &ReactorHandle) -> io::Result<Self> {
        let sock = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        sock.set_reuseaddr(true)?;
        sock.bind(addr)?;
        let ln = sock.listen(BACKLOG)?;
        let local = ln.local_addr()?;

        tracing::info!(endpoint = %endpoint, local = %local, "tunnel: tcp listener bound");

        Ok(Self {
            endpoint,
            local,
            accept: Some(reactor.spawn_accept(endpoint, ln)),
            children: HashMap::new(),
        })
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.accept.is_none()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn adopt(&mut self, peer: SocketAddr, stream: TcpStream, reactor: &ReactorHandle) {
        if self.is_closed() {
            return;
        }
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let (queue, qrx) = mpsc::unbounded_channel();
        let child = Child {
            queue,
            _reader: reactor.spawn_reader(self.endpoint, peer, rd),
            _writer: reactor.spawn_writer(self.endpoint, peer, wr, qrx),
        };
        if self.children.insert(peer, child).is_some() {
            tracing::warn!(endpoint = %self.endpoint, peer = %peer, "tunnel: replaced stale connection");
        }
        tracing::debug!(endpoint = %self.endpoint, peer = %peer, "tunnel: accepted");
    }

    /// Queues `payload` for the connection from `peer`.
    ///
    /// Data for a peer with no live connection means the server's routing is out of sync
    /// with ours; the whole listener is closed.
    pub fn send_back(&mut self, peer: SocketAddr, payload: Bytes) -> Result<(), ListenerError> {
        if self.is_closed() {
            return Err(ListenerError::Closed);
        }
        let Some(child) = self.children.get(&peer) else {
            tracing::warn!(endpoint = %self.endpoint, peer = %peer, "tunnel: data for unknown peer; closing listener");
            self.close();
            return Err(ListenerError::UnknownPeer(peer));
        };
        if child.queue.send(payload).is_err() {
            self.children.remove(&peer);
            return Err(ListenerError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        Ok(())
    }

    pub fn remove_child(&mut self, peer: SocketAddr) -> bool {
        self.children.remove(&peer).is_some()
    }

    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        let n = self.children.len();
        self.children.clear();
        self.accept = None;
        tracing::info!(endpoint = %self.endpoint, local = %self.local, children = n, "tunnel: tcp listener closed");
    }
}
