use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::evtun::tunnel::{
    frame::{EndpointId, Transport},
    reactor::ReactorHandle,
};

pub mod tcp;
pub mod udp;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("bind {endpoint} on {addr}: {source}")]
    Bind {
        endpoint: EndpointId,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no live connection for peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("listener closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// A locally bound socket forwarding one [`EndpointId`].
#[derive(Debug)]
pub enum Listener {
    Tcp(tcp::TcpBind),
    Udp(udp::UdpBind),
}

impl Listener {
    pub fn bind(
        endpoint: EndpointId,
        host: IpAddr,
        reactor: &ReactorHandle,
    ) -> Result<Self, ListenerError> {
        let addr = SocketAddr::new(host, endpoint.port);
        let res = match endpoint.transport {
            Transport::Tcp => tcp::TcpBind::bind(endpoint, addr, reactor).map(Listener::Tcp),
            Transport::Udp => udp::UdpBind::bind(endpoint, addr, reactor).map(Listener::Udp),
        };
        res.map_err(|source| ListenerError::Bind {
            endpoint,
            addr,
            source,
        })
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> EndpointId {
        match self {
            Listener::Tcp(l) => l.endpoint(),
            Listener::Udp(l) => l.endpoint(),
        }
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(l) => l.local_addr(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Listener::Tcp(l) => l.is_closed(),
            Listener::Udp(l) => l.is_closed(),
        }
    }

    /// Writes `payload` back to the local peer that originated traffic on this endpoint.
    pub fn send_back(&mut self, peer: SocketAddr, payload: Bytes) -> Result<(), ListenerError> {
        match self {
            Listener::Tcp(l) => l.send_back(peer, payload),
            Listener::Udp(l) => l.send_back(peer, &payload),
        }
    }

    /// Takes ownership of a connection accepted on this listener. Ignored for UDP.
    pub fn adopt(&mut self, peer: SocketAddr, stream: TcpStream, reactor: &ReactorHandle) {
        if let Listener::Tcp(l) = self {
            l.adopt(peer, stream, reactor);
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            Listener::Tcp(l) => l.child_count(),
            Listener::Udp(_) => 0,
        }
    }

    pub fn remove_child(&mut self, peer: SocketAddr) -> bool {
        match self {
            Listener::Tcp(l) => l.remove_child(peer),
            Listener::Udp(_) => false,
        }
    }

    pub fn close(&mut self) {
        match self {
            Listener::Tcp(l) => l.close(),
            Listener::Udp(l) => l.close(),
        }
    }
}
