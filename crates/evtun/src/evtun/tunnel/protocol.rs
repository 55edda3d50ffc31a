//! Control messages exchanged on the tunnel connection before data frames flow.
//!
//! Both are single delimited text units carrying JSON: the client's metadata first,
//! then the server's [`TunnelConfig`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evtun::tunnel::frame::{EndpointId, FrameError, Transport};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata contains the line delimiter")]
    DelimiterInMetadata,
}

/// Listener set and wire format requested by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(rename = "type", default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub bind: Vec<BindRequest>,
}

fn default_format() -> String {
    "text".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub protocol: ProtocolRef,
    pub port: u16,
}

/// `protocol` is normally the IP protocol number; older servers send `"tcp"` / `"udp"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProtocolRef {
    Number(i64),
    Name(String),
}

impl BindRequest {
    pub fn endpoint(&self) -> Result<EndpointId, FrameError> {
        let transport = match &self.protocol {
            ProtocolRef::Number(n) => Transport::from_number(*n)?,
            ProtocolRef::Name(s) => Transport::from_name(s)?,
        };
        Ok(EndpointId::new(transport, self.port))
    }
}

pub fn encode_handshake(
    metadata: &serde_json::Value,
    delimiter: &[u8],
) -> Result<Bytes, ProtocolError> {
    let b = serde_json::to_vec(metadata)?;
    if !delimiter.is_empty() && b.windows(delimiter.len()).any(|w| w == delimiter) {
        return Err(ProtocolError::DelimiterInMetadata);
    }
    let mut out = BytesMut::with_capacity(b.len() + delimiter.len());
    out.put_slice(&b);
    out.put_slice(delimiter);
    Ok(out.freeze())
}

pub fn parse_config(unit: &[u8]) -> Result<TunnelConfig, ProtocolError> {
    Ok(serde_json::from_slice(unit)?)
}
