use std::{
    fmt,
    net::{SocketAddr, SocketAddrV6},
};

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown transport {0}")]
    UnknownTransport(i64),
    #[error("unknown transport name {0:?}")]
    UnknownTransportName(String),
    #[error("unknown address family {0}")]
    UnknownFamily(i64),
}

/// Local transport of a forwarding channel.
///
/// The discriminants are the IP protocol numbers (`IPPROTO_TCP` / `IPPROTO_UDP`),
/// which is also how the server names them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Transport {
    Tcp = 6,
    Udp = 17,
}

impl Transport {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: i64) -> Result<Self, FrameError> {
        match n {
            6 => Ok(Transport::Tcp),
            17 => Ok(Transport::Udp),
            other => Err(FrameError::UnknownTransport(other)),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, FrameError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            _ => Err(FrameError::UnknownTransportName(name.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// A logical forwarding channel: one locally bound port of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub transport: Transport,
    pub port: u16,
}

impl EndpointId {
    pub fn new(transport: Transport, port: u16) -> Self {
        Self { transport, port }
    }

    #[cfg(test)]
    pub fn tcp(port: u16) -> Self {
        Self::new(Transport::Tcp, port)
    }

    #[cfg(test)]
    pub fn udp(port: u16) -> Self {
        Self::new(Transport::Udp, port)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.port)
    }
}

/// Address family of a local peer, numbered like Linux `AF_INET` / `AF_INET6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressFamily {
    Inet = 2,
    Inet6 = 10,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: i64) -> Result<Self, FrameError> {
        match n {
            2 => Ok(AddressFamily::Inet),
            10 => Ok(AddressFamily::Inet6),
            other => Err(FrameError::UnknownFamily(other)),
        }
    }
}

/// The part of a local peer address that a frame can carry.
///
/// IPv6 flow info and scope id have no wire field. They are cleared when a peer is first
/// seen so that the address the server echoes back matches the one we keyed on.
pub fn wire_peer(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => addr,
        SocketAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(*v6.ip(), v6.port(), 0, 0)),
    }
}

/// One routed unit of payload exchanged over the tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub endpoint: EndpointId,
    pub peer: SocketAddr,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(endpoint: EndpointId, peer: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            peer,
            payload: payload.into(),
        }
    }
}
