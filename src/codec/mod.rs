//! Object codecs
//!
//! Input files, work logs, and final output files are all sequences of
//! objects. A [`Codec`] opens readers and writers for one on-disk encoding:
//!
//! - `text`: one object per line (blank lines skipped). Strings are written
//!   raw, every other value as compact JSON.
//! - `jsonl`: one JSON value per line.
//! - `msgpack`: `[4 bytes: length (little-endian u32)][N bytes: MessagePack]`,
//!   the same framing the distributed protocol uses.
//!
//! Readers return `Ok(None)` at a clean end of stream. A record cut short by a
//! crash mid-write is reported as an `InvalidData` or `UnexpectedEof` error so
//! that log replay can stop there and keep what it already read.

pub mod json;
pub mod msgpack;
pub mod text;

use crate::work::Payload;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

pub use json::JsonLinesCodec;
pub use msgpack::MsgPackCodec;
pub use text::TextCodec;

/// Sequential reader of objects
pub trait ObjectReader: Send {
    /// Read the next object, or `None` at end of stream
    fn read_object(&mut self) -> io::Result<Option<Payload>>;

    /// Byte offset just past the last object read successfully
    fn position(&self) -> u64;
}

/// Sequential writer of objects
pub trait ObjectWriter: Send {
    fn write_object(&mut self, object: &Payload) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Factory for the readers and writers of one encoding
pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;

    fn reader(&self, path: &Path, buf_size: usize) -> io::Result<Box<dyn ObjectReader>>;

    /// Open a writer, appending to an existing file when `append` is set
    fn writer(&self, path: &Path, append: bool, buf_size: usize)
        -> io::Result<Box<dyn ObjectWriter>>;
}

/// Available encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// One object per line
    Text,
    /// One JSON value per line
    Jsonl,
    /// Length-prefixed MessagePack records
    Msgpack,
}

impl Default for CodecKind {
    fn default() -> Self {
        Self::Text
    }
}

impl CodecKind {
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            Self::Text => Arc::new(TextCodec),
            Self::Jsonl => Arc::new(JsonLinesCodec),
            Self::Msgpack => Arc::new(MsgPackCodec),
        }
    }

    /// Whether this encoding can hold whole work items
    pub fn is_structured(self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Jsonl => write!(f, "jsonl"),
            Self::Msgpack => write!(f, "msgpack"),
        }
    }
}

pub(crate) fn open_for_write(path: &Path, append: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(path)
}

pub(crate) fn invalid_data(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn read_all(codec: &dyn Codec, path: &Path) -> Vec<Payload> {
        let mut reader = codec.reader(path, 8192).unwrap();
        let mut objects = Vec::new();
        while let Some(object) = reader.read_object().unwrap() {
            objects.push(object);
        }
        objects
    }

    #[test]
    fn test_structured_codecs_keep_values() {
        let dir = TempDir::new().unwrap();
        let values = vec![json!({"number": 1, "payload": "a"}), json!([1, 2, 3]), json!(null)];

        for kind in [CodecKind::Jsonl, CodecKind::Msgpack] {
            let path = dir.path().join(format!("objects.{}", kind));
            let codec = kind.codec();
            let mut writer = codec.writer(&path, false, 8192).unwrap();
            for value in &values {
                writer.write_object(value).unwrap();
            }
            writer.flush().unwrap();
            drop(writer);

            assert_eq!(read_all(codec.as_ref(), &path), values, "codec {}", kind);
        }
    }

    #[test]
    fn test_append_extends_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let codec = CodecKind::Jsonl.codec();

        let mut first = codec.writer(&path, false, 8192).unwrap();
        first.write_object(&json!(1)).unwrap();
        first.flush().unwrap();
        drop(first);

        let mut second = codec.writer(&path, true, 8192).unwrap();
        second.write_object(&json!(2)).unwrap();
        second.flush().unwrap();
        drop(second);

        assert_eq!(read_all(codec.as_ref(), &path), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_only_text_is_unstructured() {
        assert!(!CodecKind::Text.is_structured());
        assert!(CodecKind::Jsonl.is_structured());
        assert!(CodecKind::Msgpack.is_structured());
    }
}
