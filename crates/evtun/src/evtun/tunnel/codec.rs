use bytes::Bytes;
use thiserror::Error;

use crate::evtun::tunnel::{
    frame::{Frame, FrameError},
    reader::ChunkedReader,
};

pub mod binary;
pub mod text;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported wire format {0:?} (expected text|binary)")]
    UnsupportedFormat(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Wire encoding of [`Frame`]s, chosen once per session.
///
/// Decoding is driven by the session's [`ChunkedReader`]: every unit it cuts is handed to
/// [`Codec::on_unit`], which may switch the reader mode for the next unit.
pub trait Codec: Send {
    fn name(&self) -> &'static str;

    /// Prepares the reader for the first data unit.
    fn setup(&mut self, reader: &mut ChunkedReader);

    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError>;

    fn on_unit(
        &mut self,
        unit: Bytes,
        reader: &mut ChunkedReader,
    ) -> Result<Option<Frame>, CodecError>;
}

pub fn parse_format(name: &str) -> Result<String, CodecError> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "text".into();
    }
    match n.as_str() {
        "text" | "binary" => Ok(n),
        _ => Err(CodecError::UnsupportedFormat(name.to_string())),
    }
}

pub fn codec_by_name(name: &str, delimiter: &[u8]) -> Result<Box<dyn Codec>, CodecError> {
    let n = parse_format(name)?;
    match n.as_str() {
        "text" => Ok(Box::new(text::TextCodec::new(delimiter))),
        "binary" => Ok(Box::new(binary::BinaryCodec::new())),
        _ => unreachable!(),
    }
}
