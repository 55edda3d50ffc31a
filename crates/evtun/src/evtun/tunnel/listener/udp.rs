use std::{io, net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;

use crate::evtun::tunnel::{
    frame::EndpointId,
    listener::ListenerError,
    reactor::{ReactorHandle, Task},
};

/// Bound UDP socket. Keeps no per-peer state: replies go to whatever address the frame names.
#[derive(Debug)]
pub struct UdpBind {
    endpoint: EndpointId,
    local: SocketAddr,
    // Socket and its receive task, dropped together on close.
    inner: Option<(Arc<UdpSocket>, Task)>,
}

impl UdpBind {
    pub fn bind(endpoint: EndpointId, addr: SocketAddr, reactor: &ReactorHandle) -> io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        let sock = Arc::new(UdpSocket::from_std(std_sock)?);
        let local = sock.local_addr()?;

        tracing::info!(endpoint = %endpoint, local = %local, "tunnel: udp listener bound");

        Ok(Self {
            endpoint,
            local,
            inner: Some((sock.clone(), reactor.spawn_datagrams(endpoint, sock))),
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
        self.inner.is_none()
    }

    /// Sends one datagram to `peer`. A full socket buffer drops it, like any datagram loss.
    pub fn send_back(&mut self, peer: SocketAddr, payload: &[u8]) -> Result<(), ListenerError> {
        let Some((sock, _)) = self.inner.as_ref() else {
            return Err(ListenerError::Closed);
        };
        match sock.try_send_to(payload, peer) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!(endpoint = %self.endpoint, peer = %peer, "tunnel: udp send buffer full; dropped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.inner = None;
        tracing::info!(endpoint = %self.endpoint, local = %self.local, "tunnel: udp listener closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::evtun::tunnel::reactor::{Event, Reactor};

    #[tokio::test]
    async fn datagram_in_and_reply_out() {
        let mut r = Reactor::new();
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let mut l = UdpBind::bind(EndpointId::udp(port), addr, &r.handle()).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"query", addr).await.unwrap();

        let peer = match tokio::time::timeout(Duration::from_secs(5), r.next()).await {
            Ok(Some(Event::Data { endpoint, peer, payload })) => {
                assert_eq!(endpoint, EndpointId::udp(port));
                assert_eq!(&payload[..], b"query");
                peer
            }
            other => panic!("unexpected: {other:?}"),
        };

        l.send_back(peer, b"answer").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, addr);

        l.close();
        assert!(matches!(l.send_back(peer, b"late"), Err(ListenerError::Closed)));
    }
}
