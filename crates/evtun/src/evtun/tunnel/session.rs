use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
};

use crate::evtun::tunnel::{
    codec::{self, Codec, CodecError},
    frame::{EndpointId, Frame},
    listener::{Listener, ListenerError},
    protocol::{self, ProtocolError, TunnelConfig},
    reactor::{Event, RECV_MAX, Reactor, ReactorHandle},
    reader::{ChunkedReader, DEFAULT_BUFFER_CAP, DEFAULT_DELIMITER, ReaderError},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect {addr}: timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("server closed the connection")]
    Disconnected,
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("reader: {0}")]
    Reader(#[from] ReaderError),
    #[error("bound {bound} of {requested} requested listeners")]
    PartialBind { requested: usize, bound: usize },
    #[error("frame for unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("frame for unknown peer {peer} on {endpoint}")]
    UnknownPeer { endpoint: EndpointId, peer: SocketAddr },
    #[error("listener {endpoint} failed: {source}")]
    ListenerFailed {
        endpoint: EndpointId,
        #[source]
        source: io::Error,
    },
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, SessionError::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingConfig,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Address local listeners are bound to.
    pub bind_host: IpAddr,
    /// Cap on unconsumed bytes buffered from the tunnel connection.
    pub buffer_cap: usize,
    pub delimiter: Bytes,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            buffer_cap: DEFAULT_BUFFER_CAP,
            delimiter: Bytes::from_static(DEFAULT_DELIMITER),
        }
    }
}

/// Protocol state of one tunnel connection.
///
/// Owns the reader, the codec and every local listener. I/O is left to the caller
/// ([`run_session`]): bytes from the server go into [`Session::on_wire_data`], reactor
/// events into [`Session::on_event`], and whatever those return goes to the server.
/// Any error closes the session before it is returned.
pub struct Session {
    state: SessionState,
    opts: SessionOptions,
    reader: ChunkedReader,
    codec: Option<Box<dyn Codec>>,
    listeners: HashMap<EndpointId, Listener>,
    reactor: ReactorHandle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("codec", &self.codec_name())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(opts: SessionOptions, reactor: ReactorHandle) -> Self {
        Self {
            state: SessionState::Connecting,
            reader: ChunkedReader::new(opts.delimiter.clone(), opts.buffer_cap),
            opts,
            codec: None,
            listeners: HashMap::new(),
            reactor,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn codec_name(&self) -> Option<&'static str> {
        self.codec.as_ref().map(|c| c.name())
    }

    #[cfg(test)]
    pub fn listener(&self, endpoint: &EndpointId) -> Option<&Listener> {
        self.listeners.get(endpoint)
    }

    /// Number of listeners still open.
    #[cfg(test)]
    pub fn live_listeners(&self) -> usize {
        self.listeners.values().filter(|l| !l.is_closed()).count()
    }

    /// Connected: produces the metadata unit to send and starts waiting for configuration.
    pub fn handshake(&mut self, metadata: &serde_json::Value) -> Result<Bytes, SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::Closed);
        }
        let res = protocol::encode_handshake(metadata, &self.opts.delimiter);
        match res {
            Ok(b) => {
                self.state = SessionState::AwaitingConfig;
                Ok(b)
            }
            Err(err) => {
                self.close();
                Err(err.into())
            }
        }
    }

    pub fn on_wire_data(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let res = self.consume(data);
        if res.is_err() {
            self.close();
        }
        res
    }

    /// Handles one reactor event; returns bytes to write to the tunnel connection, if any.
    pub fn on_event(&mut self, ev: Event) -> Result<Option<Bytes>, SessionError> {
        let res = self.dispatch(ev);
        if res.is_err() {
            self.close();
        }
        res
    }

    /// Closes every listener (and with them their connections) and stops reading.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        for l in self.listeners.values_mut() {
            l.close();
        }
        self.listeners.clear();
        self.reader.close();
        self.codec = None;
        self.state = SessionState::Closed;
        tracing::debug!("tunnel: session closed");
    }

    fn consume(&mut self, data: &[u8]) -> Result<(), SessionError> {
        match self.state {
            SessionState::AwaitingConfig | SessionState::Active => {}
            _ => return Err(SessionError::Closed),
        }
        self.reader.feed(data)?;
        while let Some(unit) = self.reader.next_unit()? {
            match self.state {
                SessionState::AwaitingConfig => {
                    let cfg = protocol::parse_config(&unit)?;
                    self.apply_config(cfg)?;
                }
                SessionState::Active => {
                    let Some(codec) = self.codec.as_mut() else {
                        return Err(SessionError::Closed);
                    };
                    if let Some(frame) = codec.on_unit(unit, &mut self.reader)? {
                        self.route(frame)?;
                    }
                }
                _ => return Err(SessionError::Closed),
            }
        }
        Ok(())
    }

    fn apply_config(&mut self, cfg: TunnelConfig) -> Result<(), SessionError> {
        tracing::info!(format = %cfg.format, bind = cfg.bind.len(), "tunnel: config received");

        let mut codec = codec::codec_by_name(&cfg.format, self.reader.delimiter())?;

        let requested = cfg.bind.len();
        for b in &cfg.bind {
            let endpoint = match b.endpoint() {
                Ok(ep) => ep,
                Err(err) => {
                    tracing::error!(port = b.port, err = %err, "tunnel: failed to bind");
                    continue;
                }
            };
            match Listener::bind(endpoint, self.opts.bind_host, &self.reactor) {
                Ok(l) => {
                    self.listeners.insert(endpoint, l);
                }
                Err(err) => {
                    tracing::error!(endpoint = %endpoint, err = %err, "tunnel: failed to bind");
                }
            }
        }

        let bound = self.listeners.len();
        if bound != requested {
            tracing::error!(requested, bound, "tunnel: unable to bind everything");
            return Err(SessionError::PartialBind { requested, bound });
        }

        codec.setup(&mut self.reader);
        self.codec = Some(codec);
        self.state = SessionState::Active;
        tracing::info!(codec = self.codec_name().unwrap_or(""), listeners = bound, "tunnel: active");
        Ok(())
    }

    fn route(&mut self, frame: Frame) -> Result<(), SessionError> {
        let Some(l) = self.listeners.get_mut(&frame.endpoint) else {
            tracing::error!(endpoint = %frame.endpoint, peer = %frame.peer, "tunnel: frame for unknown endpoint");
            return Err(SessionError::UnknownEndpoint(frame.endpoint));
        };
        match l.send_back(frame.peer, frame.payload) {
            Ok(()) => Ok(()),
            // The listener has already closed itself and its connections.
            Err(ListenerError::UnknownPeer(peer)) => Err(SessionError::UnknownPeer {
                endpoint: frame.endpoint,
                peer,
            }),
            Err(ListenerError::Closed) => {
                tracing::error!(endpoint = %frame.endpoint, peer = %frame.peer, "tunnel: frame for closed listener");
                Err(SessionError::UnknownEndpoint(frame.endpoint))
            }
            Err(err) => {
                tracing::debug!(endpoint = %frame.endpoint, peer = %frame.peer, err = %err, "tunnel: send back failed");
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, ev: Event) -> Result<Option<Bytes>, SessionError> {
        match ev {
            Event::Accepted {
                endpoint,
                peer,
                stream,
            } => {
                if let Some(l) = self.listeners.get_mut(&endpoint) {
                    l.adopt(peer, stream, &self.reactor);
                }
                Ok(None)
            }
            Event::Data {
                endpoint,
                peer,
                payload,
            } => {
                if self.state != SessionState::Active {
                    return Ok(None);
                }
                if !self.listeners.get(&endpoint).is_some_and(|l| !l.is_closed()) {
                    return Ok(None);
                }
                let Some(codec) = self.codec.as_ref() else {
                    return Ok(None);
                };
                let out = codec.encode(&Frame::new(endpoint, peer, payload))?;
                Ok(Some(out))
            }
            Event::Closed {
                endpoint,
                peer,
                err,
            } => {
                let removed = self
                    .listeners
                    .get_mut(&endpoint)
                    .is_some_and(|l| l.remove_child(peer));
                match err {
                    Some(err) if removed => {
                        tracing::info!(endpoint = %endpoint, peer = %peer, err = %err, "tunnel: connection error")
                    }
                    None if removed => {
                        tracing::debug!(endpoint = %endpoint, peer = %peer, "tunnel: connection closed")
                    }
                    _ => {}
                }
                Ok(None)
            }
            Event::ListenerFailed { endpoint, err } => {
                let Some(l) = self.listeners.get_mut(&endpoint).filter(|l| !l.is_closed()) else {
                    return Ok(None);
                };
                tracing::error!(endpoint = %endpoint, children = l.child_count(), err = %err, "tunnel: listener failed");
                l.close();
                Err(SessionError::ListenerFailed {
                    endpoint,
                    source: err,
                })
            }
        }
    }
}

/// Opens the tunnel connection. A zero `timeout` waits for the OS to give up.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, SessionError> {
    let dial = TcpStream::connect(addr);
    let res = if timeout.is_zero() {
        dial.await
    } else {
        match tokio::time::timeout(timeout, dial).await {
            Ok(res) => res,
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout,
                });
            }
        }
    };
    let stream = res.map_err(|source| SessionError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Runs one session over an established tunnel connection until it fails or `shutdown`
/// flips to true (`Ok`). Listeners are closed on every exit path.
pub async fn run_session<S>(
    stream: S,
    metadata: &serde_json::Value,
    opts: SessionOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reactor = Reactor::new();
    let mut sess = Session::new(opts, reactor.handle());
    let (mut rd, mut wr) = tokio::io::split(stream);

    let res = drive(&mut sess, &mut reactor, &mut rd, &mut wr, metadata, &mut shutdown).await;

    sess.close();
    let _ = wr.shutdown().await;
    res
}

async fn drive<R, W>(
    sess: &mut Session,
    reactor: &mut Reactor,
    rd: &mut R,
    wr: &mut W,
    metadata: &serde_json::Value,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = sess.handshake(metadata)?;
    wr.write_all(&hello).await?;
    wr.flush().await?;

    let mut buf = vec![0u8; RECV_MAX];
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            res = rd.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    return Err(SessionError::Disconnected);
                }
                sess.on_wire_data(&buf[..n])?;
            }
            ev = reactor.next() => {
                let Some(ev) = ev else {
                    return Ok(());
                };
                if let Some(out) = sess.on_event(ev)? {
                    wr.write_all(&out).await?;
                    wr.flush().await?;
                }
            }
        }
    }
}
