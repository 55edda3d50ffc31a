//! Line-oriented, human-readable wire format.
//!
//! One frame per line: `<transport> <port> <family> <ip> <peer-port> <base64(payload)>`.

use std::net::{IpAddr, SocketAddr};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};

use crate::evtun::tunnel::{
    codec::{Codec, CodecError},
    frame::{AddressFamily, EndpointId, Frame, Transport},
    reader::ChunkedReader,
};

const FIELDS: usize = 6;

pub struct TextCodec {
    delimiter: Bytes,
}

impl TextCodec {
    pub fn new(delimiter: &[u8]) -> Self {
        Self {
            delimiter: Bytes::copy_from_slice(delimiter),
        }
    }

    pub fn decode_line(line: &[u8]) -> Result<Frame, CodecError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| CodecError::Malformed("line is not utf-8".into()))?;
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != FIELDS {
            return Err(CodecError::Malformed(format!(
                "expected {FIELDS} fields, got {}",
                fields.len()
            )));
        }

        let transport = Transport::from_number(parse_int(fields[0], "transport")?)?;
        let port = parse_port(fields[1], "port")?;
        let family = AddressFamily::from_number(parse_int(fields[2], "family")?)?;
        let ip: IpAddr = fields[3]
            .parse()
            .map_err(|_| CodecError::Malformed(format!("bad ip {:?}", fields[3])))?;
        let peer_port = parse_port(fields[4], "peer port")?;
        let payload = STANDARD.decode(fields[5])?;

        let peer = SocketAddr::new(ip, peer_port);
        if AddressFamily::of(&peer) != family {
            return Err(CodecError::Malformed(format!(
                "family {} does not match ip {ip}",
                family.as_u8()
            )));
        }

        Ok(Frame::new(EndpointId::new(transport, port), peer, payload))
    }
}

fn parse_int(s: &str, what: &str) -> Result<i64, CodecError> {
    s.parse::<i64>()
        .map_err(|_| CodecError::Malformed(format!("bad {what} {s:?}")))
}

fn parse_port(s: &str, what: &str) -> Result<u16, CodecError> {
    let n = parse_int(s, what)?;
    u16::try_from(n).map_err(|_| CodecError::Malformed(format!("{what} out of range: {n}")))
}

impl Codec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn setup(&mut self, reader: &mut ChunkedReader) {
        reader.set_delimited();
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let line = format!(
            "{} {} {} {} {} {}",
            frame.endpoint.transport.as_u8(),
            frame.endpoint.port,
            AddressFamily::of(&frame.peer).as_u8(),
            frame.peer.ip(),
            frame.peer.port(),
            STANDARD.encode(&frame.payload),
        );
        let mut out = BytesMut::with_capacity(line.len() + self.delimiter.len());
        out.put_slice(line.as_bytes());
        out.put_slice(&self.delimiter);
        Ok(out.freeze())
    }

    fn on_unit(
        &mut self,
        unit: Bytes,
        _reader: &mut ChunkedReader,
    ) -> Result<Option<Frame>, CodecError> {
        Self::decode_line(&unit).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Frame {
        Frame::new(
            EndpointId::tcp(7000),
            "127.0.0.1:54321".parse().unwrap(),
            Bytes::from_static(b"hello"),
        )
    }

    #[test]
    fn encodes_hello_line() {
        let c = TextCodec::new(b"\n");
        let out = c.encode(&hello()).unwrap();
        assert_eq!(&out[..], b"6 7000 2 127.0.0.1 54321 aGVsbG8=\n");
    }

    #[test]
    fn decodes_through_reader() {
        let mut c = TextCodec::new(b"\n");
        let mut r = ChunkedReader::default();
        c.setup(&mut r);

        let udp6 = Frame::new(
            EndpointId::udp(5353),
            "[::1]:40000".parse().unwrap(),
            Bytes::from(vec![0u8, 255, 10, 13]),
        );
        let mut wire = c.encode(&hello()).unwrap().to_vec();
        wire.extend_from_slice(&c.encode(&udp6).unwrap());
        r.feed(&wire).unwrap();

        let mut got = Vec::new();
        while let Some(unit) = r.next_unit().unwrap() {
            got.push(c.on_unit(unit, &mut r).unwrap().unwrap());
        }
        assert_eq!(got, vec![hello(), udp6]);
    }

    #[test]
    fn empty_payload_line() {
        let f = Frame::new(EndpointId::tcp(1), "10.0.0.1:2".parse().unwrap(), Bytes::new());
        let c = TextCodec::new(b"\n");
        let out = c.encode(&f).unwrap();
        assert_eq!(&out[..], b"6 1 2 10.0.0.1 2 \n");
        assert_eq!(TextCodec::decode_line(&out[..out.len() - 1]).unwrap(), f);
    }

    #[test]
    fn scoped_link_local_peer_comes_back_as_accepted() {
        use std::net::SocketAddrV6;

        use crate::evtun::tunnel::frame::wire_peer;

        let scoped = SocketAddr::V6(SocketAddrV6::new("fe80::2".parse().unwrap(), 6000, 0, 4));
        let f = Frame::new(EndpointId::udp(53), wire_peer(scoped), Bytes::from_static(b"q"));
        let out = TextCodec::new(b"\n").encode(&f).unwrap();
        assert_eq!(&out[..], b"17 53 10 fe80::2 6000 cQ==\n");
        assert_eq!(TextCodec::decode_line(&out[..out.len() - 1]).unwrap(), f);
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in [
            &b"6 7000 2 127.0.0.1 54321"[..],
            b"6 7000 2 127.0.0.1 54321 aGVsbG8= extra",
            b"6  7000 2 127.0.0.1 54321 aGVsbG8=",
            b"x 7000 2 127.0.0.1 54321 aGVsbG8=",
            b"6 70000 2 127.0.0.1 54321 aGVsbG8=",
            b"9 7000 2 127.0.0.1 54321 aGVsbG8=",
            b"6 7000 10 127.0.0.1 54321 aGVsbG8=",
            b"6 7000 2 localhost 54321 aGVsbG8=",
            b"6 7000 2 127.0.0.1 54321 !!!",
            b"\xff",
        ] {
            assert!(
                TextCodec::decode_line(line).is_err(),
                "accepted {:?}",
                String::from_utf8_lossy(line)
            );
        }
    }
}
