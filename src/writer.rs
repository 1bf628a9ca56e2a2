use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::info;

use crate::bgzf::BgzfWriter;
use crate::error::{Error, Result};
use crate::index::IndexBuilder;
use crate::record::{Record, DEFAULT_COLUMNS};

/// Where output for `destination` actually lands: indexed output is always `.gz`.
pub fn output_path(destination: &Path, make_tabix: bool) -> PathBuf {
    let is_gz = destination
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"));
    if make_tabix && !is_gz {
        let mut name = destination.as_os_str().to_owned();
        name.push(".gz");
        PathBuf::from(name)
    } else {
        destination.to_path_buf()
    }
}

/// Serializes records as tab-delimited text with a single `#`-prefixed header line.
#[derive(Debug, Clone)]
pub struct Writer {
    columns: Vec<String>,
}

impl Writer {
    /// Columns may name any record field, known or extra.
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_owned()).collect(),
        }
    }

    /// The normalized layout read back by
    /// [`ParserConfig::standard`](crate::ParserConfig::standard).
    pub fn standard() -> Self {
        Self::new(&DEFAULT_COLUMNS)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn header(&self) -> String {
        format!("#{}", self.columns.iter().join("\t"))
    }

    fn line(&self, record: &Record) -> String {
        self.columns.iter().map(|c| record.get(c)).join("\t")
    }

    /// Write the header and one line per record. Returns the number of records.
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::{Record, Writer};
    ///
    /// let mut record = Record::new("1", 100, Some("A"), None).unwrap();
    /// record.set_pvalue(Some(0.05)).unwrap();
    /// let mut out = Vec::new();
    /// Writer::new(&["chrom", "pos", "ref", "alt", "pvalue"])
    ///     .write_to(&mut out, vec![Ok(record)])
    ///     .unwrap();
    /// assert_eq!(
    ///     String::from_utf8(out).unwrap(),
    ///     "#chrom\tpos\tref\talt\tpvalue\n1\t100\tA\t.\t0.05\n"
    /// );
    /// ```
    pub fn write_to<W, I>(&self, mut out: W, records: I) -> Result<usize>
    where
        W: Write,
        I: IntoIterator<Item = Result<Record>>,
    {
        writeln!(out, "{}", self.header())?;
        let mut rows = 0;
        for record in records {
            writeln!(out, "{}", self.line(&record?))?;
            rows += 1;
        }
        out.flush()?;
        Ok(rows)
    }

    /// Write to a file. With `make_tabix` the output is BGZF-compressed, gains a `.gz`
    /// extension if needed, and a `.tbi` index is written next to it; records must
    /// then arrive grouped by chromosome and sorted by position.
    ///
    /// Returns the path actually written. On failure while indexing, the partial
    /// output is removed.
    pub fn write_path<P, I>(&self, destination: P, records: I, make_tabix: bool) -> Result<PathBuf>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = Result<Record>>,
    {
        let path = output_path(destination.as_ref(), make_tabix);
        if !make_tabix {
            let rows = self.write_to(BufWriter::new(File::create(&path)?), records)?;
            info!(path = %path.display(), rows, indexed = false, "wrote output");
            return Ok(path);
        }

        let result = self.write_indexed(&path, records);
        if result.is_err() {
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(index_path(&path));
        }
        let rows = result?;
        info!(path = %path.display(), rows, indexed = true, "wrote output");
        Ok(path)
    }

    fn write_indexed<I>(&self, path: &Path, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let position_of = |name: &str| self.columns.iter().position(|c| c == name);
        let (col_seq, col_beg) = match (position_of("chrom"), position_of("pos")) {
            (Some(seq), Some(beg)) => (seq, beg),
            _ => {
                return Err(Error::Indexing(
                    "indexed output needs both `chrom` and `pos` columns".to_owned(),
                ))
            }
        };

        let mut out = BgzfWriter::new(BufWriter::new(File::create(path)?));
        let mut index = IndexBuilder::new(col_seq, col_beg);
        writeln!(out, "{}", self.header())?;
        let mut rows = 0;
        for record in records {
            let record = record?;
            let start = out.virtual_position();
            writeln!(out, "{}", self.line(&record))?;
            index.push(record.chrom(), record.pos(), start, out.virtual_position())?;
            rows += 1;
        }
        out.finish()?.into_inner().map_err(|e| e.into_error())?;
        index.finish().write_path(index_path(path))?;
        Ok(rows)
    }
}

/// `<path>.tbi`
pub fn index_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tbi");
    PathBuf::from(name)
}
