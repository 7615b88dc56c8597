use super::{invalid_data, open_for_write, Codec, CodecKind, ObjectReader, ObjectWriter};
use crate::work::Payload;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// One JSON value per line
pub struct JsonLinesCodec;

impl Codec for JsonLinesCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Jsonl
    }

    fn reader(&self, path: &Path, buf_size: usize) -> io::Result<Box<dyn ObjectReader>> {
        let file = File::open(path)?;
        Ok(Box::new(JsonLinesReader {
            inner: BufReader::with_capacity(buf_size, file),
            line: String::new(),
            position: 0,
        }))
    }

    fn writer(
        &self,
        path: &Path,
        append: bool,
        buf_size: usize,
    ) -> io::Result<Box<dyn ObjectWriter>> {
        let file = open_for_write(path, append)?;
        Ok(Box::new(JsonLinesWriter {
            inner: BufWriter::with_capacity(buf_size, file),
        }))
    }
}

struct JsonLinesReader {
    inner: BufReader<File>,
    line: String,
    position: u64,
}

impl ObjectReader for JsonLinesReader {
    fn read_object(&mut self) -> io::Result<Option<Payload>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                self.position += n as u64;
                continue;
            }
            let value = serde_json::from_str(trimmed).map_err(invalid_data)?;
            self.position += n as u64;
            return Ok(Some(value));
        }
    }

    fn position(&self) -> u64 {
        self.position
    }
}

struct JsonLinesWriter {
    inner: BufWriter<File>,
}

impl ObjectWriter for JsonLinesWriter {
    fn write_object(&mut self, object: &Payload) -> io::Result<()> {
        serde_json::to_writer(&mut self.inner, object).map_err(invalid_data)?;
        self.inner.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
