//! Blocked gzip (BGZF): a gzip stream made of independently inflatable blocks,
//! addressed by 64-bit virtual offsets.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Largest uncompressed payload per block; keeps the compressed block under 64 KiB.
pub const MAX_BLOCK_SIZE: usize = 0xff00;

const HEADER_SIZE: usize = 18;
const FOOTER_SIZE: usize = 8;

/// The empty block that terminates every BGZF file.
pub const EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// `compressed_offset << 16 | offset_within_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    pub fn new(compressed: u64, uncompressed: u16) -> Self {
        Self(compressed << 16 | u64::from(uncompressed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Byte offset of the containing block in the file.
    pub fn compressed(self) -> u64 {
        self.0 >> 16
    }

    /// Offset within the inflated block.
    pub fn uncompressed(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressed(), self.uncompressed())
    }
}

fn compress_block(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut deflate = DeflateEncoder::new(Vec::new(), Compression::default());
    deflate.write_all(data)?;
    let deflated = deflate.finish()?;

    let total = HEADER_SIZE + deflated.len() + FOOTER_SIZE;
    let bsize = u16::try_from(total - 1).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "compressed block exceeds 64 KiB")
    })?;

    let mut block = Vec::with_capacity(total);
    // gzip header with FEXTRA set, one `BC` subfield holding the block size
    block.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    block.extend_from_slice(&6u16.to_le_bytes());
    block.extend_from_slice(b"BC");
    block.extend_from_slice(&2u16.to_le_bytes());
    block.extend_from_slice(&bsize.to_le_bytes());
    block.extend_from_slice(&deflated);
    block.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    block.extend_from_slice(&(data.len() as u32).to_le_bytes());
    Ok(block)
}

/// Writes BGZF blocks, tracking the virtual offset of the next byte.
pub struct BgzfWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
    compressed_offset: u64,
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(MAX_BLOCK_SIZE),
            compressed_offset: 0,
        }
    }

    /// Where the next written byte will land.
    pub fn virtual_position(&self) -> VirtualOffset {
        // the buffer is flushed as soon as it fills, so it always fits in 16 bits
        VirtualOffset::new(self.compressed_offset, self.buffer.len() as u16)
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let block = compress_block(&self.buffer)?;
        self.inner.write_all(&block)?;
        self.compressed_offset += block.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the last block, append the EOF marker and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        self.inner.write_all(&EOF_MARKER)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = MAX_BLOCK_SIZE - self.buffer.len();
        let n = buf.len().min(room);
        self.buffer.extend_from_slice(&buf[..n]);
        if self.buffer.len() >= MAX_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.inner.flush()
    }
}

/// Reads a BGZF file block by block, with random access by virtual offset.
pub struct BgzfReader<R> {
    inner: R,
    block: Vec<u8>,
    cursor: usize,
    block_offset: u64,
    next_block_offset: u64,
}

impl<R: Read + Seek> BgzfReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            block: Vec::new(),
            cursor: 0,
            block_offset: 0,
            next_block_offset: 0,
        }
    }

    pub fn virtual_position(&self) -> VirtualOffset {
        if self.cursor < self.block.len() {
            VirtualOffset::new(self.block_offset, self.cursor as u16)
        } else {
            VirtualOffset::new(self.next_block_offset, 0)
        }
    }

    pub fn seek(&mut self, offset: VirtualOffset) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset.compressed()))?;
        self.next_block_offset = offset.compressed();
        self.block.clear();
        self.cursor = 0;
        self.read_block()?;
        let within = usize::from(offset.uncompressed());
        if within > self.block.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("virtual offset {} is past the end of its block", offset),
            ));
        }
        self.cursor = within;
        Ok(())
    }

    /// Inflate the block at `next_block_offset`; returns `false` at end of file.
    fn read_block(&mut self) -> io::Result<bool> {
        let mut header = [0u8; HEADER_SIZE];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.block.clear();
                self.cursor = 0;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        if header[0..4] != [0x1f, 0x8b, 0x08, 0x04] {
            return Err(invalid("block does not start with a BGZF header"));
        }
        let xlen = usize::from(u16::from_le_bytes([header[10], header[11]]));
        // the fixed header covers one 6-byte subfield; read any further extra bytes
        let mut extra = header[12..].to_vec();
        if xlen > 6 {
            let mut rest = vec![0u8; xlen - 6];
            self.inner.read_exact(&mut rest)?;
            extra.extend_from_slice(&rest);
        }
        let bsize = block_size(&extra)
            .ok_or_else(|| invalid("BGZF block is missing its BC subfield"))?;
        let header_len = 12 + xlen;
        if bsize < header_len + FOOTER_SIZE {
            return Err(invalid("BGZF block size is smaller than its header"));
        }

        let mut body = vec![0u8; bsize - header_len];
        self.inner.read_exact(&mut body)?;
        let (cdata, footer) = body.split_at(body.len() - FOOTER_SIZE);
        let crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let isize = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]) as usize;

        self.block.clear();
        self.block.reserve(isize);
        DeflateDecoder::new(cdata).read_to_end(&mut self.block)?;
        if self.block.len() != isize || crc32fast::hash(&self.block) != crc {
            return Err(invalid("BGZF block failed its integrity check"));
        }

        self.block_offset = self.next_block_offset;
        self.next_block_offset += bsize as u64;
        self.cursor = 0;
        Ok(true)
    }

    /// Append the next line (without its newline) to `buf`. Returns the number of
    /// bytes consumed including the newline, 0 at end of file.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut consumed = 0;
        loop {
            if self.cursor >= self.block.len() && !self.read_block()? {
                return Ok(consumed);
            }
            let available = &self.block[self.cursor..];
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    buf.extend_from_slice(&available[..idx]);
                    self.cursor += idx + 1;
                    return Ok(consumed + idx + 1);
                }
                None => {
                    buf.extend_from_slice(available);
                    consumed += available.len();
                    self.cursor = self.block.len();
                }
            }
        }
    }
}

fn block_size(mut extra: &[u8]) -> Option<usize> {
    while extra.len() >= 4 {
        let slen = usize::from(u16::from_le_bytes([extra[2], extra[3]]));
        if &extra[..2] == b"BC" && slen == 2 && extra.len() >= 6 {
            return Some(usize::from(u16::from_le_bytes([extra[4], extra[5]])) + 1);
        }
        extra = extra.get(4 + slen..)?;
    }
    None
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn eof_marker_is_an_empty_block() {
        let mut reader = BgzfReader::new(Cursor::new(EOF_MARKER.to_vec()));
        let mut line = Vec::new();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
        assert!(line.is_empty());
    }

    #[test]
    fn output_is_plain_gzip_compatible() {
        let mut writer = BgzfWriter::new(Vec::new());
        writer.write_all(b"hello\nworld\n").unwrap();
        let bytes = writer.finish().unwrap();
        let mut text = String::new();
        flate2::read::MultiGzDecoder::new(&bytes[..])
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "hello\nworld\n");
    }

    #[test]
    fn lines_resume_from_virtual_offsets() {
        let mut writer = BgzfWriter::new(Vec::new());
        let mut starts = Vec::new();
        for i in 0..20_000 {
            starts.push(writer.virtual_position());
            writeln!(writer, "line\t{}\t{}", i, "x".repeat(i % 7)).unwrap();
        }
        let bytes = writer.finish().unwrap();
        assert!(starts.last().unwrap().compressed() > 0, "expected several blocks");

        let mut reader = BgzfReader::new(Cursor::new(bytes));
        for &i in &[0usize, 1, 9_999, 19_998] {
            reader.seek(starts[i]).unwrap();
            let mut line = Vec::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, format!("line\t{}\t{}", i, "x".repeat(i % 7)).into_bytes());
            assert_eq!(reader.virtual_position(), starts[i + 1]);
        }
    }
}
