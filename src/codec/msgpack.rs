use super::{invalid_data, open_for_write, Codec, CodecKind, ObjectReader, ObjectWriter};
use crate::work::Payload;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Records larger than this are treated as corruption
const MAX_RECORD_LEN: usize = 100 * 1024 * 1024;

/// Length-prefixed MessagePack records
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Msgpack
    }

    fn reader(&self, path: &Path, buf_size: usize) -> io::Result<Box<dyn ObjectReader>> {
        let file = File::open(path)?;
        Ok(Box::new(MsgPackReader {
            inner: BufReader::with_capacity(buf_size, file),
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
        Ok(Box::new(MsgPackWriter {
            inner: BufWriter::with_capacity(buf_size, file),
        }))
    }
}

struct MsgPackReader {
    inner: BufReader<File>,
    position: u64,
}

impl MsgPackReader {
    /// Fill `buf` completely; `Ok(false)` only if the stream ended before the first byte
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("record cut short after {} of {} bytes", filled, buf.len()),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl ObjectReader for MsgPackReader {
    fn read_object(&mut self) -> io::Result<Option<Payload>> {
        let mut len_buf = [0u8; 4];
        if !self.fill(&mut len_buf)? {
            return Ok(None);
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record too large: {} bytes (max 100MB)", len),
            ));
        }

        let mut body = vec![0u8; len];
        if !self.fill(&mut body)? && len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "record length without body",
            ));
        }

        let value = rmp_serde::from_slice(&body).map_err(invalid_data)?;
        self.position += (len_buf.len() + len) as u64;
        Ok(Some(value))
    }

    fn position(&self) -> u64 {
        self.position
    }
}

struct MsgPackWriter {
    inner: BufWriter<File>,
}

impl ObjectWriter for MsgPackWriter {
    fn write_object(&mut self, object: &Payload) -> io::Result<()> {
        let body = rmp_serde::to_vec(object).map_err(invalid_data)?;
        self.inner.write_all(&(body.len() as u32).to_le_bytes())?;
        self.inner.write_all(&body)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
