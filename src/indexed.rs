use std::cell::OnceCell;
use std::fs::File;
use std::io::BufReader;
use std::iter::FusedIterator;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bgzf::{BgzfReader, VirtualOffset};
use crate::error::{Error, Result};
use crate::index::{Chunk, TabixIndex};
use crate::parser::{normalize_chrom, Parser};
use crate::pipeline::Pipeline;
use crate::reader::{ErrorRecord, ParserSource, Reader};
use crate::record::Record;
use crate::writer::index_path;

/// A [`Reader`] over a BGZF file with a `.tbi` index, adding range queries.
///
/// Whole-file iteration, filters and the other reader operations are available
/// through `Deref`. Each [`fetch`](IndexedReader::fetch) opens its own handle, so
/// range queries and whole-file passes can be interleaved freely.
///
/// The index is trusted: a file that is not sorted by position yields wrong or
/// partial results rather than an error.
#[derive(Debug)]
pub struct IndexedReader {
    reader: Reader,
    path: PathBuf,
    index: OnceCell<TabixIndex>,
}

impl IndexedReader {
    /// # Examples
    ///
    /// ```
    /// use sumstats::{IndexedReader, ParserConfig};
    ///
    /// let reader =
    ///     IndexedReader::from_path("resources/standard.tsv.gz", ParserConfig::standard());
    /// let positions: Vec<u32> = reader
    ///     .fetch("1", 800_000, 900_000)
    ///     .unwrap()
    ///     .map(|record| record.unwrap().pos())
    ///     .collect();
    /// assert_eq!(positions, vec![846_808, 861_808]);
    /// ```
    pub fn from_path<P, S>(path: P, parser: S) -> Self
    where
        P: AsRef<Path>,
        S: Into<ParserSource>,
    {
        Self {
            reader: Reader::from_path(path.as_ref(), parser),
            path: path.as_ref().to_path_buf(),
            index: OnceCell::new(),
        }
    }

    /// Wrap a configured file reader.
    pub fn from_reader(reader: Reader) -> Result<Self> {
        let path = match reader.path() {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(Error::config(
                    "range queries need a file-backed reader",
                ))
            }
        };
        Ok(Self {
            reader,
            path,
            index: OnceCell::new(),
        })
    }

    pub fn into_inner(self) -> Reader {
        self.reader
    }

    pub fn index_path(&self) -> PathBuf {
        index_path(&self.path)
    }

    fn load_index(&self) -> Result<&TabixIndex> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let path = self.index_path();
        if !path.exists() {
            return Err(Error::MissingIndex(path));
        }
        let index = TabixIndex::from_path(&path)?;
        debug!(path = %path.display(), "loaded tabix index");
        Ok(self.index.get_or_init(|| index))
    }

    /// Records on `chrom` with `start <= pos <= end` (1-based, inclusive), in file
    /// order, after the registered pipeline.
    ///
    /// `chrom` may be given with or without a `chr` prefix. An unknown chromosome or
    /// an empty range yields no records.
    pub fn fetch(&self, chrom: &str, start: u32, end: u32) -> Result<Fetch<'_>> {
        let start = start.max(1);
        if start > end {
            return Err(Error::config(format!(
                "invalid range {}:{}-{}: start is after end",
                chrom, start, end
            )));
        }
        let parser = self.reader.ensure_parser()?;
        let index = self.load_index()?;

        let stripped = match chrom.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("chr") && chrom.len() > 3 => &chrom[3..],
            _ => chrom,
        };
        let prefixed = format!("chr{}", stripped);
        let name = [chrom, stripped, prefixed.as_str()]
            .into_iter()
            .find(|name| index.contains(name));
        let chunks = match name {
            Some(name) => index.query(name, start - 1, end),
            None => Vec::new(),
        };
        let meta = index.meta_char();
        debug!(chrom, start, end, chunks = chunks.len(), "fetching range");

        let handle = if chunks.is_empty() {
            None
        } else {
            Some(BgzfReader::new(BufReader::new(File::open(&self.path)?)))
        };
        let reader = &self.reader;
        let target = normalize_chrom(
            chrom,
            parser.config().chrom_case(),
            parser.config().missing_values(),
        )
        .map_err(Error::config)?;

        Ok(Fetch {
            handle,
            chunks: chunks.into_iter(),
            chunk_end: VirtualOffset::default(),
            meta,
            target,
            start,
            end,
            parser,
            pipeline: reader.pipeline(),
            skip_errors: reader.is_skipping_errors(),
            max_errors: reader.error_limit(),
            errors: Vec::new(),
            line_number: 0,
            buf: Vec::new(),
        })
    }
}

impl Deref for IndexedReader {
    type Target = Reader;

    fn deref(&self) -> &Reader {
        &self.reader
    }
}

impl DerefMut for IndexedReader {
    fn deref_mut(&mut self) -> &mut Reader {
        &mut self.reader
    }
}

/// Records of one range query. Parse errors follow the reader's `skip_errors`
/// setting and are kept on this cursor, numbered from the first line it read.
pub struct Fetch<'a> {
    handle: Option<BgzfReader<BufReader<File>>>,
    chunks: std::vec::IntoIter<Chunk>,
    chunk_end: VirtualOffset,
    meta: char,
    target: String,
    start: u32,
    end: u32,
    parser: &'a Parser,
    pipeline: &'a Pipeline,
    skip_errors: bool,
    max_errors: Option<usize>,
    errors: Vec<ErrorRecord>,
    line_number: usize,
    buf: Vec<u8>,
}

impl<'a> Fetch<'a> {
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    fn fail(&mut self, error: Error) -> Option<Result<Record>> {
        self.handle = None;
        Some(Err(error))
    }

    /// Next raw line inside the remaining chunks.
    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let handle = match self.handle.as_mut() {
                Some(handle) => handle,
                None => return Ok(None),
            };
            if handle.virtual_position() >= self.chunk_end {
                let chunk = loop {
                    match self.chunks.next() {
                        Some(chunk) if chunk.end <= handle.virtual_position() => continue,
                        Some(chunk) => break Some(chunk),
                        None => break None,
                    }
                };
                match chunk {
                    Some(chunk) => {
                        let fresh = self.chunk_end == VirtualOffset::default();
                        if fresh || handle.virtual_position() < chunk.start {
                            handle.seek(chunk.start)?;
                        }
                        self.chunk_end = chunk.end;
                    }
                    None => {
                        self.handle = None;
                        return Ok(None);
                    }
                }
            }
            self.buf.clear();
            if handle.read_line(&mut self.buf)? == 0 {
                self.handle = None;
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim_end_matches('\r');
            if line.starts_with(self.meta) || line.trim().is_empty() {
                continue;
            }
            return Ok(Some(line.to_owned()));
        }
    }
}

impl<'a> Iterator for Fetch<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return self.fail(e),
            };
            self.line_number += 1;
            // lines whose identity cannot be read go on to the full parse and fail there
            if let Some((chrom, pos)) = self.parser.locate(&line) {
                if chrom != self.target || pos < self.start {
                    continue;
                }
                if pos > self.end {
                    self.handle = None;
                    return None;
                }
            }
            let record = match self.parser.parse(&line) {
                Ok(record) => record,
                Err(Error::LineParse { message, line }) if self.skip_errors => {
                    warn!(line_number = self.line_number, %message, "skipping unparseable line");
                    self.errors.push(ErrorRecord {
                        line_number: self.line_number,
                        message,
                        raw_line: line,
                    });
                    match self.max_errors {
                        Some(max) if self.errors.len() >= max => {
                            let count = self.errors.len();
                            return self.fail(Error::TooManyBadLines { count });
                        }
                        _ => continue,
                    }
                }
                Err(e) => return self.fail(e),
            };
            match self.pipeline.apply(record) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<'a> FusedIterator for Fetch<'a> {}
