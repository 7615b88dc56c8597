use super::{open_for_write, Codec, CodecKind, ObjectReader, ObjectWriter};
use crate::work::Payload;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Line-oriented codec for plain text inputs and outputs
pub struct TextCodec;

impl Codec for TextCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Text
    }

    fn reader(&self, path: &Path, buf_size: usize) -> io::Result<Box<dyn ObjectReader>> {
        let file = File::open(path)?;
        Ok(Box::new(TextReader {
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
        Ok(Box::new(TextWriter {
            inner: BufWriter::with_capacity(buf_size, file),
        }))
    }
}

struct TextReader {
    inner: BufReader<File>,
    line: String,
    position: u64,
}

impl ObjectReader for TextReader {
    fn read_object(&mut self) -> io::Result<Option<Payload>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            self.position += n as u64;
            let trimmed = self.line.trim_end_matches(&['\n', '\r'][..]);
            if !trimmed.trim().is_empty() {
                return Ok(Some(Payload::String(trimmed.to_string())));
            }
        }
    }

    fn position(&self) -> u64 {
        self.position
    }
}

struct TextWriter {
    inner: BufWriter<File>,
}

impl ObjectWriter for TextWriter {
    fn write_object(&mut self, object: &Payload) -> io::Result<()> {
        match object {
            Payload::String(s) => writeln!(self.inner, "{}", s),
            other => writeln!(self.inner, "{}", other),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
