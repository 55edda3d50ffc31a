//! Compact wire format: a fixed 24-byte header followed by the raw payload.
//!
//! Header layout (big-endian):
//!
//! | bytes | field            |
//! |-------|------------------|
//! | 1     | transport        |
//! | 2     | bind port        |
//! | 1     | address family   |
//! | 16    | ip (v4 zero-padded) |
//! | 2     | peer port        |
//! | 2     | payload length   |

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    num::NonZeroUsize,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::evtun::tunnel::{
    codec::{Codec, CodecError},
    frame::{AddressFamily, EndpointId, Frame, Transport},
    reader::ChunkedReader,
};

pub const HEADER_LEN: usize = 24;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const HEADER_UNIT: NonZeroUsize = match NonZeroUsize::new(HEADER_LEN) {
    Some(n) => n,
    None => panic!("empty header"),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    endpoint: EndpointId,
    peer: SocketAddr,
    len: usize,
}

impl Header {
    fn parse(mut b: &[u8]) -> Result<Self, CodecError> {
        if b.len() != HEADER_LEN {
            return Err(CodecError::Malformed(format!(
                "header is {} bytes, expected {HEADER_LEN}",
                b.len()
            )));
        }
        let transport = Transport::from_number(b.get_u8() as i64)?;
        let port = b.get_u16();
        let family = AddressFamily::from_number(b.get_u8() as i64)?;
        let mut raw = [0u8; 16];
        b.copy_to_slice(&mut raw);
        let peer_port = b.get_u16();
        let len = b.get_u16() as usize;

        let ip = match family {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::from(raw)),
        };

        Ok(Self {
            endpoint: EndpointId::new(transport, port),
            peer: SocketAddr::new(ip, peer_port),
            len,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Header,
    Body(Header),
}

pub struct BinaryCodec {
    state: State,
}

impl BinaryCodec {
    pub fn new() -> Self {
        Self {
            state: State::Header,
        }
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn setup(&mut self, reader: &mut ChunkedReader) {
        self.state = State::Header;
        reader.set_fixed_size(HEADER_UNIT);
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let n = frame.payload.len();
        if n > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(n));
        }

        let mut raw = [0u8; 16];
        match frame.peer.ip() {
            IpAddr::V4(ip) => raw[..4].copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => raw.copy_from_slice(&ip.octets()),
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + n);
        out.put_u8(frame.endpoint.transport.as_u8());
        out.put_u16(frame.endpoint.port);
        out.put_u8(AddressFamily::of(&frame.peer).as_u8());
        out.put_slice(&raw);
        out.put_u16(frame.peer.port());
        out.put_u16(n as u16);
        out.put_slice(&frame.payload);
        Ok(out.freeze())
    }

    fn on_unit(
        &mut self,
        unit: Bytes,
        reader: &mut ChunkedReader,
    ) -> Result<Option<Frame>, CodecError> {
        match self.state {
            State::Header => {
                let h = Header::parse(&unit)?;
                let Some(body) = NonZeroUsize::new(h.len) else {
                    return Ok(Some(Frame::new(h.endpoint, h.peer, Bytes::new())));
                };
                self.state = State::Body(h);
                reader.set_fixed_size(body);
                Ok(None)
            }
            State::Body(h) => {
                if unit.len() != h.len {
                    return Err(CodecError::Malformed(format!(
                        "body is {} bytes, header declared {}",
                        unit.len(),
                        h.len
                    )));
                }
                self.state = State::Header;
                reader.set_fixed_size(HEADER_UNIT);
                Ok(Some(Frame::new(h.endpoint, h.peer, unit)))
            }
        }
    }
}
