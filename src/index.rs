//! Tabix (`.tbi`) positional index: a binning index over 37 450 bins plus a 16 kb
//! linear index, stored BGZF-compressed next to the data file.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use indexmap::IndexMap;
use nom::bytes::complete::{tag, take};
use nom::multi::count;
use nom::number::complete::{le_i32, le_u32, le_u64};
use nom::IResult;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;

use crate::bgzf::{BgzfWriter, VirtualOffset};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"TBI\x01";

/// Pseudo-bin carrying per-reference metadata (offset span, mapped counts).
pub const META_BIN: u32 = 37450;

/// Positions at or beyond this cannot be binned.
pub const MAX_POSITION: u32 = 1 << 29;

const LINEAR_SHIFT: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum TabixFormat {
    Generic = 0,
    Sam = 1,
    Vcf = 2,
}

/// A contiguous run of compressed data `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: VirtualOffset,
    pub end: VirtualOffset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceIndex {
    name: String,
    bins: IndexMap<u32, Vec<Chunk>>,
    intervals: Vec<VirtualOffset>,
}

impl ReferenceIndex {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabixIndex {
    format: TabixFormat,
    /// 1-based column numbers, as stored on disk.
    col_seq: i32,
    col_beg: i32,
    col_end: i32,
    meta: u8,
    skip: i32,
    references: Vec<ReferenceIndex>,
}

impl TabixIndex {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut raw = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut raw)?;
        let index = Self::from_bytes(&raw)?;
        debug!(
            path = %path.as_ref().display(),
            references = index.references.len(),
            "loaded tabix index"
        );
        Ok(index)
    }

    /// Parse an index, inflating it first when it is (BGZF or plain) gzip.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let inflated;
        let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut buf = Vec::new();
            MultiGzDecoder::new(raw).read_to_end(&mut buf)?;
            inflated = buf;
            &inflated[..]
        } else {
            raw
        };
        match parse_index(bytes) {
            Ok((_, index)) => Ok(index),
            Err(e) => Err(Error::InvalidIndex(match e {
                nom::Err::Incomplete(_) => "truncated index".to_owned(),
                nom::Err::Error(e) | nom::Err::Failure(e) => {
                    format!("malformed index near byte {}", bytes.len() - e.input.len())
                }
            })),
        }
    }

    /// Serialize (BGZF-compressed) to `out`.
    pub fn write_to<W: Write>(&self, out: W) -> Result<W> {
        let mut writer = BgzfWriter::new(out);
        writer.write_all(MAGIC)?;
        let names: Vec<u8> = self
            .references
            .iter()
            .flat_map(|r| r.name.bytes().chain(std::iter::once(0)))
            .collect();
        for value in [
            self.references.len() as i32,
            self.format.into(),
            self.col_seq,
            self.col_beg,
            self.col_end,
            i32::from(self.meta),
            self.skip,
            names.len() as i32,
        ] {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.write_all(&names)?;
        for reference in &self.references {
            writer.write_all(&(reference.bins.len() as i32).to_le_bytes())?;
            for (bin, chunks) in &reference.bins {
                writer.write_all(&bin.to_le_bytes())?;
                writer.write_all(&(chunks.len() as i32).to_le_bytes())?;
                for chunk in chunks {
                    writer.write_all(&chunk.start.as_raw().to_le_bytes())?;
                    writer.write_all(&chunk.end.as_raw().to_le_bytes())?;
                }
            }
            writer.write_all(&(reference.intervals.len() as i32).to_le_bytes())?;
            for offset in &reference.intervals {
                writer.write_all(&offset.as_raw().to_le_bytes())?;
            }
        }
        // n_no_coor
        writer.write_all(&0u64.to_le_bytes())?;
        Ok(writer.finish()?)
    }

    pub fn write_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let out = self.write_to(BufWriter::new(File::create(path)?))?;
        out.into_inner().map_err(|e| e.into_error())?;
        Ok(())
    }

    pub fn format(&self) -> TabixFormat {
        self.format
    }

    pub fn col_seq(&self) -> i32 {
        self.col_seq
    }

    pub fn col_beg(&self) -> i32 {
        self.col_beg
    }

    /// Column of the interval end; single-position records reuse `col_beg`.
    pub fn col_end(&self) -> i32 {
        self.col_end
    }

    pub fn meta_char(&self) -> char {
        char::from(self.meta)
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(|r| r.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.references.iter().any(|r| r.name == name)
    }

    /// Chunks that may hold records overlapping the 0-based half-open `[beg, end)`.
    /// Unknown references have no chunks.
    pub fn query(&self, name: &str, beg: u32, end: u32) -> Vec<Chunk> {
        let reference = match self.references.iter().find(|r| r.name == name) {
            Some(reference) => reference,
            None => return Vec::new(),
        };
        let end = end.min(MAX_POSITION);
        if beg >= end {
            return Vec::new();
        }
        let min_offset = reference
            .intervals
            .get((beg >> LINEAR_SHIFT) as usize)
            .or_else(|| reference.intervals.last())
            .copied()
            .unwrap_or_default();

        let mut chunks: Vec<Chunk> = reg2bins(beg, end)
            .into_iter()
            .filter_map(|bin| reference.bins.get(&bin))
            .flatten()
            .filter(|chunk| chunk.end > min_offset)
            .copied()
            .collect();
        chunks.sort_by_key(|c| c.start);

        let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match merged.last_mut() {
                Some(last) if chunk.start <= last.end => last.end = last.end.max(chunk.end),
                _ => merged.push(chunk),
            }
        }
        debug!(reference = name, beg, end, chunks = merged.len(), "queried tabix index");
        merged
    }
}

fn parse_name_block(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    let (input, len) = le_i32(input)?;
    let (input, block) = take(usize::try_from(len).unwrap_or_default())(input)?;
    let names = block
        .split(|&b| b == 0)
        .filter(|n| !n.is_empty())
        .map(|n| String::from_utf8_lossy(n).into_owned())
        .collect();
    Ok((input, names))
}

fn parse_chunk(input: &[u8]) -> IResult<&[u8], Chunk> {
    let (input, start) = le_u64(input)?;
    let (input, end) = le_u64(input)?;
    Ok((
        input,
        Chunk {
            start: VirtualOffset::from_raw(start),
            end: VirtualOffset::from_raw(end),
        },
    ))
}

fn parse_bin(input: &[u8]) -> IResult<&[u8], (u32, Vec<Chunk>)> {
    let (input, bin) = le_u32(input)?;
    let (input, n_chunk) = le_i32(input)?;
    let (input, chunks) = count(parse_chunk, n_chunk.max(0) as usize)(input)?;
    Ok((input, (bin, chunks)))
}

fn parse_reference<'a>(input: &'a [u8], name: &str) -> IResult<&'a [u8], ReferenceIndex> {
    let (input, n_bin) = le_i32(input)?;
    let (input, bins) = count(parse_bin, n_bin.max(0) as usize)(input)?;
    let (input, n_intv) = le_i32(input)?;
    let (input, intervals) = count(le_u64, n_intv.max(0) as usize)(input)?;
    Ok((
        input,
        ReferenceIndex {
            name: name.to_owned(),
            bins: bins.into_iter().collect(),
            intervals: intervals.into_iter().map(VirtualOffset::from_raw).collect(),
        },
    ))
}

fn parse_index(input: &[u8]) -> IResult<&[u8], TabixIndex> {
    let (input, _) = tag(&MAGIC[..])(input)?;
    let (input, n_ref) = le_i32(input)?;
    let (input, format) = le_i32(input)?;
    let format = TabixFormat::try_from(format & 0xffff).map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    let (input, col_seq) = le_i32(input)?;
    let (input, col_beg) = le_i32(input)?;
    let (input, col_end) = le_i32(input)?;
    let (input, meta) = le_i32(input)?;
    let (input, skip) = le_i32(input)?;
    let (mut input, names) = parse_name_block(input)?;
    if names.len() != n_ref.max(0) as usize {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Count,
        )));
    }
    let mut references = Vec::with_capacity(names.len());
    for name in &names {
        let (rest, reference) = parse_reference(input, name)?;
        references.push(reference);
        input = rest;
    }
    // the trailing n_no_coor is optional and not needed for queries
    Ok((
        input,
        TabixIndex {
            format,
            col_seq,
            col_beg,
            col_end,
            meta: meta as u8,
            skip,
            references,
        },
    ))
}

/// Smallest bin fully containing the 0-based half-open `[beg, end)`.
pub fn reg2bin(beg: u32, end: u32) -> u32 {
    let end = end - 1;
    for (shift, offset) in [(14, 4681), (17, 585), (20, 73), (23, 9), (26, 1)] {
        if beg >> shift == end >> shift {
            return offset + (beg >> shift);
        }
    }
    0
}

/// Every bin that may overlap the 0-based half-open `[beg, end)`.
pub fn reg2bins(beg: u32, end: u32) -> Vec<u32> {
    let end = end - 1;
    let mut bins = vec![0];
    for (shift, offset) in [(26, 1), (23, 9), (20, 73), (17, 585), (14, 4681)] {
        bins.extend((offset + (beg >> shift))..=(offset + (end >> shift)));
    }
    bins
}

/// Builds a [`TabixIndex`] while records are written, in file order.
#[derive(Debug)]
pub struct IndexBuilder {
    col_seq: i32,
    col_beg: i32,
    references: Vec<ReferenceIndex>,
    last_pos: u32,
    first_offset: VirtualOffset,
    last_offset: VirtualOffset,
    mapped: u64,
}

impl IndexBuilder {
    /// `col_seq`/`col_beg` are 0-based column indices of the chromosome and position.
    pub fn new(col_seq: usize, col_beg: usize) -> Self {
        Self {
            col_seq: col_seq as i32 + 1,
            col_beg: col_beg as i32 + 1,
            references: Vec::new(),
            last_pos: 0,
            first_offset: VirtualOffset::default(),
            last_offset: VirtualOffset::default(),
            mapped: 0,
        }
    }

    /// Register one record spanning `[start, end)` in the compressed output.
    ///
    /// Fails when records are not grouped by chromosome and sorted by position.
    pub fn push(
        &mut self,
        chrom: &str,
        pos: u32,
        start: VirtualOffset,
        end: VirtualOffset,
    ) -> Result<()> {
        if pos == 0 || pos >= MAX_POSITION {
            return Err(Error::Indexing(format!(
                "position {}:{} is outside the indexable range",
                chrom, pos
            )));
        }
        let is_current = self.references.last().map_or(false, |r| r.name == chrom);
        if !is_current {
            if self.references.iter().any(|r| r.name == chrom) {
                return Err(Error::Indexing(format!(
                    "records for chromosome {} are not contiguous",
                    chrom
                )));
            }
            self.finish_reference();
            self.references.push(ReferenceIndex::new(chrom));
            self.last_pos = 0;
            self.first_offset = start;
            self.mapped = 0;
        } else if pos < self.last_pos {
            return Err(Error::Indexing(format!(
                "position {}:{} follows {}:{}; input is not sorted",
                chrom, pos, chrom, self.last_pos
            )));
        }
        self.last_pos = pos;
        self.last_offset = end;
        self.mapped += 1;

        let beg = pos - 1;
        let reference = match self.references.last_mut() {
            Some(reference) => reference,
            None => return Err(Error::Indexing("no active reference".to_owned())),
        };
        let chunks = reference.bins.entry(reg2bin(beg, pos)).or_default();
        match chunks.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => chunks.push(Chunk { start, end }),
        }
        let window = (beg >> LINEAR_SHIFT) as usize;
        while reference.intervals.len() <= window {
            reference.intervals.push(start);
        }
        Ok(())
    }

    fn finish_reference(&mut self) {
        if let Some(reference) = self.references.last_mut() {
            reference.bins.insert(
                META_BIN,
                vec![
                    Chunk {
                        start: self.first_offset,
                        end: self.last_offset,
                    },
                    Chunk {
                        start: VirtualOffset::from_raw(self.mapped),
                        end: VirtualOffset::from_raw(0),
                    },
                ],
            );
        }
    }

    pub fn finish(mut self) -> TabixIndex {
        self.finish_reference();
        TabixIndex {
            format: TabixFormat::Generic,
            col_seq: self.col_seq,
            col_beg: self.col_beg,
            col_end: self.col_beg,
            meta: b'#',
            skip: 0,
            references: self.references,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(raw: u64) -> VirtualOffset {
        VirtualOffset::from_raw(raw)
    }

    #[test]
    fn bins_follow_the_tabix_scheme() {
        assert_eq!(reg2bin(0, 1), 4681);
        assert_eq!(reg2bin(16_384, 16_385), 4682);
        assert_eq!(reg2bin(0, 20_000), 585);
        assert_eq!(reg2bin(0, MAX_POSITION), 0);
        let bins = reg2bins(1000, 2000);
        assert!(bins.contains(&0));
        assert!(bins.contains(&reg2bin(1000, 2000)));
        assert!(bins.contains(&4681));
    }

    #[test]
    fn rejects_unsorted_input() {
        let mut builder = IndexBuilder::new(0, 1);
        builder.push("1", 100, offset(0), offset(10)).unwrap();
        assert!(matches!(
            builder.push("1", 50, offset(10), offset(20)),
            Err(Error::Indexing(_))
        ));
        builder.push("2", 5, offset(10), offset(20)).unwrap();
        assert!(builder.push("1", 500, offset(20), offset(30)).is_err());
        assert!(builder.push("2", MAX_POSITION, offset(20), offset(30)).is_err());
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut builder = IndexBuilder::new(0, 1);
        builder.push("1", 100, offset(0), offset(10)).unwrap();
        builder.push("1", 40_000, offset(10), offset(20)).unwrap();
        builder.push("X", 7, offset(20), offset(30)).unwrap();
        let index = builder.finish();

        let bytes = index.write_to(Vec::new()).unwrap();
        let parsed = TabixIndex::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, index);
        assert_eq!(parsed.meta_char(), '#');
        assert_eq!(parsed.col_beg(), 2);
        assert_eq!(parsed.col_end(), 2);
        assert_eq!(parsed.references().collect::<Vec<_>>(), vec!["1", "X"]);

        assert_eq!(
            parsed.query("1", 99, 100),
            vec![Chunk {
                start: offset(0),
                end: offset(10)
            }]
        );
        assert!(parsed.query("2", 0, 100).is_empty());
        // 40_000 lives in linear window 2; the first window's record is skipped
        let far = parsed.query("1", 39_999, 40_000);
        assert_eq!(far.len(), 1);
        assert_eq!(far[0].end, offset(20));
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(
            TabixIndex::from_bytes(b"CSI\x01rest"),
            Err(Error::InvalidIndex(_))
        ));
    }
}
