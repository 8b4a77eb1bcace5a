//! zlib compressed protocol.
//!
//! Once `CLIENT_COMPRESS` is negotiated, the framed packet stream is carried
//! inside compressed packets with a 7-byte header: compressed length (3),
//! compressed sequence id (1) and uncompressed length (3). An uncompressed
//! length of zero means the payload is sent as-is.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::protocol::MAX_PACKET_SIZE;

pub(crate) const HEADER_SIZE: usize = 7;

/// Payloads shorter than this are not worth compressing.
const MIN_COMPRESS_LENGTH: usize = 50;

/// Compression state of one connection.
#[derive(Debug, Default)]
pub(crate) struct Compressor {
    sequence_id: u8,
    pending: Vec<u8>,
    pos: usize,
}

impl Compressor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Restart the compressed sequence at the beginning of a command.
    pub(crate) fn reset(&mut self) {
        self.sequence_id = 0;
        self.pending.clear();
        self.pos = 0;
    }

    /// Compress and write already framed packet bytes.
    pub(crate) fn write_all<W: Write>(&mut self, writer: &mut W, data: &[u8]) -> io::Result<()> {
        let mut out = Vec::with_capacity(data.len() + HEADER_SIZE);
        for chunk in data.chunks(MAX_PACKET_SIZE) {
            self.push_packet(&mut out, chunk)?;
        }
        if data.is_empty() {
            self.push_packet(&mut out, data)?;
        }
        writer.write_all(&out)?;
        writer.flush()
    }

    fn push_packet(&mut self, out: &mut Vec<u8>, chunk: &[u8]) -> io::Result<()> {
        let compressed = if chunk.len() < MIN_COMPRESS_LENGTH {
            None
        } else {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk)?;
            Some(encoder.finish()?).filter(|c| c.len() < chunk.len())
        };

        let (body, uncompressed_len) = match &compressed {
            Some(c) => (c.as_slice(), chunk.len()),
            None => (chunk, 0),
        };
        #[allow(clippy::cast_possible_truncation)]
        {
            out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
            out.push(self.sequence_id);
            out.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
        }
        out.extend_from_slice(body);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    /// Fill `buf` with decompressed bytes, reading compressed packets as needed.
    pub(crate) fn read_exact<R: Read>(&mut self, reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos == self.pending.len() {
                self.read_packet(reader)?;
                continue;
            }
            let n = (buf.len() - filled).min(self.pending.len() - self.pos);
            buf[filled..filled + n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    fn read_packet<R: Read>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let compressed_len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let sequence_id = header[3];
        let uncompressed_len = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;

        let mut body = vec![0u8; compressed_len];
        reader.read_exact(&mut body)?;

        self.pending = if uncompressed_len == 0 {
            body
        } else {
            let mut out = Vec::with_capacity(uncompressed_len);
            ZlibDecoder::new(body.as_slice()).read_to_end(&mut out)?;
            if out.len() != uncompressed_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "compressed packet inflated to {} bytes, header says {uncompressed_len}",
                        out.len()
                    ),
                ));
            }
            out
        };
        self.pos = 0;
        self.sequence_id = sequence_id.wrapping_add(1);
        tracing::trace!(
            sequence_id,
            compressed_len,
            uncompressed_len,
            "read compressed packet"
        );
        Ok(())
    }
}
