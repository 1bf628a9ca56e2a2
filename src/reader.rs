use std::cell::{Cell, OnceCell, RefCell};
use std::io::{BufRead, BufReader, Read};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use strum::Display;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lookup::Lookup;
use crate::parser::{Parser, ParserConfig};
use crate::pipeline::{Pipeline, Stage};
use crate::record::{KnownField, Record};
use crate::sniffer::Sniffer;
use crate::types::Value;
use crate::writer::{output_path, Writer};

const DEFAULT_SNIFF_LINES: usize = 100;

/// How a [`Reader`] obtains its parser: ready-made, or sniffed from the input on first use.
#[derive(Debug, Clone)]
pub enum ParserSource {
    Ready(Parser),
    Sniff(Sniffer),
}

impl From<Parser> for ParserSource {
    fn from(parser: Parser) -> Self {
        ParserSource::Ready(parser)
    }
}

impl From<ParserConfig> for ParserSource {
    fn from(config: ParserConfig) -> Self {
        ParserSource::Ready(Parser::new(config))
    }
}

impl From<Sniffer> for ParserSource {
    fn from(sniffer: Sniffer) -> Self {
        ParserSource::Sniff(sniffer)
    }
}

/// A line rejected while `skip_errors` was set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// 1-based line number in the input (relative to the range for fetches).
    pub line_number: usize,
    pub message: String,
    pub raw_line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ReaderState {
    Unopened,
    Open,
    Exhausted,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) enum Source {
    Path(PathBuf),
    Lines(Rc<[String]>),
}

enum Lines {
    File(BufReader<Box<dyn Read>>),
    Memory(Rc<[String]>, usize),
}

/// Physical lines of a source, numbered from 1, line endings removed.
pub(crate) struct LineSource {
    lines: Lines,
    line_number: usize,
    buf: Vec<u8>,
}

impl LineSource {
    pub(crate) fn open(source: &Source) -> Result<Self> {
        let lines = match source {
            Source::Path(path) => {
                let (reader, compression) = niffler::from_path(path)?;
                debug!(path = %path.display(), ?compression, "opened input");
                Lines::File(BufReader::new(reader))
            }
            Source::Lines(lines) => Lines::Memory(Rc::clone(lines), 0),
        };
        Ok(Self {
            lines,
            line_number: 0,
            buf: Vec::new(),
        })
    }

    pub(crate) fn next_line(&mut self) -> Result<Option<(usize, String)>> {
        let line = match &mut self.lines {
            Lines::File(reader) => {
                self.buf.clear();
                if reader.read_until(b'\n', &mut self.buf)? == 0 {
                    return Ok(None);
                }
                String::from_utf8_lossy(&self.buf).into_owned()
            }
            Lines::Memory(lines, next) => match lines.get(*next) {
                Some(line) => {
                    *next += 1;
                    line.clone()
                }
                None => return Ok(None),
            },
        };
        self.line_number += 1;
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r').to_owned();
        Ok(Some((self.line_number, line)))
    }
}

/// Streams normalized [`Record`]s out of a delimited GWAS file through a
/// pipeline of filters, transforms and lookups.
///
/// Nothing is opened until [`iter`](Reader::iter) is called; each call starts a
/// fresh pass from the top of the input. Passes borrow the reader immutably, so
/// range queries on an [`IndexedReader`](crate::IndexedReader) can run while a pass
/// is in progress. Registering stages needs `&mut self` and therefore waits until
/// every cursor is gone.
///
/// # Examples
///
/// ```
/// use sumstats::{ParserConfig, Reader};
///
/// let mut reader = Reader::from_path("resources/standard.tsv", ParserConfig::standard());
/// reader.add_filter("chrom", "X");
/// let positions: Vec<u32> = reader
///     .iter()
///     .unwrap()
///     .map(|record| record.unwrap().pos())
///     .collect();
/// assert_eq!(positions, vec![2_700_000, 2_700_150]);
/// ```
#[derive(Debug)]
pub struct Reader {
    source: Source,
    parser: OnceCell<Parser>,
    sniffer: Sniffer,
    skip_rows: Option<usize>,
    skip_errors: bool,
    max_errors: Option<usize>,
    sniff_lines: usize,
    pipeline: Pipeline,
    errors: RefCell<Vec<ErrorRecord>>,
    state: Cell<ReaderState>,
}

impl Reader {
    pub fn from_path<P, S>(path: P, parser: S) -> Self
    where
        P: AsRef<Path>,
        S: Into<ParserSource>,
    {
        Self::new(Source::Path(path.as_ref().to_path_buf()), parser.into())
    }

    /// Read from lines already in memory (e.g. a network response).
    pub fn from_lines<I, L, S>(lines: I, parser: S) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
        S: Into<ParserSource>,
    {
        let lines: Rc<[String]> = lines.into_iter().map(Into::into).collect();
        Self::new(Source::Lines(lines), parser.into())
    }

    fn new(source: Source, parser: ParserSource) -> Self {
        let (parser, sniffer) = match parser {
            ParserSource::Ready(parser) => (OnceCell::from(parser), Sniffer::new()),
            ParserSource::Sniff(sniffer) => (OnceCell::new(), sniffer),
        };
        Self {
            source,
            parser,
            sniffer,
            skip_rows: None,
            skip_errors: false,
            max_errors: None,
            sniff_lines: DEFAULT_SNIFF_LINES,
            pipeline: Pipeline::new(),
            errors: RefCell::new(Vec::new()),
            state: Cell::new(ReaderState::Unopened),
        }
    }

    /// Leading lines to skip. Defaults to the parser's header row count.
    pub fn skip_rows(mut self, rows: usize) -> Self {
        self.skip_rows = Some(rows);
        self
    }

    /// Record unparseable lines in [`errors`](Reader::errors) and keep going,
    /// instead of failing the pass.
    pub fn skip_errors(mut self, skip: bool) -> Self {
        self.skip_errors = skip;
        self
    }

    /// With `skip_errors`, fail with [`Error::TooManyBadLines`] once this many lines
    /// have been rejected.
    pub fn max_errors(mut self, max: usize) -> Self {
        self.max_errors = Some(max);
        self
    }

    pub fn sniff_lines(mut self, lines: usize) -> Self {
        self.sniff_lines = lines.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Path(path) => Some(path),
            Source::Lines(_) => None,
        }
    }

    /// The parser in use; `None` until a sniffing reader has been opened once.
    pub fn parser(&self) -> Option<&Parser> {
        self.parser.get()
    }

    pub(crate) fn is_skipping_errors(&self) -> bool {
        self.skip_errors
    }

    pub(crate) fn error_limit(&self) -> Option<usize> {
        self.max_errors
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Keep records whose `field` equals `value`. Records lacking the field are dropped.
    pub fn add_filter<V: Into<Value>>(&mut self, field: &str, value: V) -> &mut Self {
        self.pipeline.push(Stage::FieldEquals {
            field: field.to_owned(),
            value: value.into(),
        });
        self
    }

    /// Keep records where `field` is present (not missing).
    pub fn add_filter_present(&mut self, field: &str) -> &mut Self {
        self.pipeline.push(Stage::FieldPresent {
            field: field.to_owned(),
        });
        self
    }

    /// Keep records where `field` is present and satisfies `predicate`. An error from
    /// `predicate` ends the pass.
    pub fn add_filter_fn<F>(&mut self, field: &str, predicate: F) -> &mut Self
    where
        F: Fn(&Value) -> anyhow::Result<bool> + 'static,
    {
        self.pipeline.push(Stage::FieldMatches {
            field: field.to_owned(),
            predicate: Box::new(predicate),
        });
        self
    }

    /// Keep records satisfying a predicate over the whole record.
    pub fn add_predicate<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&Record) -> anyhow::Result<bool> + 'static,
    {
        self.pipeline.push(Stage::Predicate(Box::new(predicate)));
        self
    }

    /// Errors returned by `transform` end the pass; they are never skipped.
    pub fn add_transform<F>(&mut self, transform: F) -> &mut Self
    where
        F: Fn(Record) -> anyhow::Result<Record> + 'static,
    {
        self.pipeline.push(Stage::Transform(Box::new(transform)));
        self
    }

    /// Attach `lookup`'s answer for each record under `field`.
    pub fn add_lookup<L>(&mut self, field: &str, lookup: L) -> Result<&mut Self>
    where
        L: Lookup + 'static,
    {
        if let Ok(known) = field.parse::<KnownField>() {
            if known.is_identity() {
                return Err(Error::config(format!(
                    "lookup target `{}` is an identity field",
                    field
                )));
            }
        }
        self.pipeline.push(Stage::Lookup {
            field: field.to_owned(),
            lookup: Box::new(lookup),
        });
        Ok(self)
    }

    /// Lines rejected so far in the most recent pass (with `skip_errors`).
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.borrow().clone()
    }

    pub fn state(&self) -> ReaderState {
        self.state.get()
    }

    /// Mark the reader closed. Handles are owned by iterators and are already
    /// released once those are dropped.
    pub fn close(&self) {
        self.state.set(ReaderState::Closed);
    }

    /// The parser for this reader, sniffing the input on first use.
    pub(crate) fn ensure_parser(&self) -> Result<&Parser> {
        if let Some(parser) = self.parser.get() {
            return Ok(parser);
        }
        let mut lines = LineSource::open(&self.source)?;
        let mut sample = Vec::with_capacity(self.sniff_lines);
        while sample.len() < self.sniff_lines {
            match lines.next_line()? {
                Some((_, line)) => sample.push(line),
                None => break,
            }
        }
        let (layout, config) = self.sniffer.detect_layout(&sample)?;
        info!(
            layout,
            delimiter = %config.delimiter(),
            header_rows = config.header_rows(),
            "sniffed input layout"
        );
        Ok(self.parser.get_or_init(|| Parser::new(config)))
    }

    /// Start a fresh pass over the input.
    ///
    /// Previously collected errors are cleared. The returned cursor yields each
    /// surviving record; the first fatal error is yielded once and ends the pass.
    pub fn iter(&self) -> Result<Records<'_>> {
        let parser = self.ensure_parser()?;
        let skip = self.skip_rows.unwrap_or(parser.config().header_rows());
        let mut lines = LineSource::open(&self.source)?;
        for _ in 0..skip {
            if lines.next_line()?.is_none() {
                break;
            }
        }
        self.errors.borrow_mut().clear();
        self.state.set(ReaderState::Open);

        Ok(Records {
            lines: Some(lines),
            parser,
            pipeline: &self.pipeline,
            errors: &self.errors,
            state: &self.state,
            skip_errors: self.skip_errors,
            max_errors: self.max_errors,
            yielded: 0,
            rejected: 0,
        })
    }

    /// Drain a pass through the pipeline into `destination`.
    ///
    /// An empty `columns` slice writes the standard layout. Returns the path
    /// actually written, which gains `.gz` when `make_tabix` is set.
    pub fn write<P: AsRef<Path>>(
        &self,
        destination: P,
        columns: &[&str],
        make_tabix: bool,
    ) -> Result<PathBuf> {
        let target = output_path(destination.as_ref(), make_tabix);
        if let Source::Path(input) = &self.source {
            let same = match (input.canonicalize(), target.canonicalize()) {
                (Ok(a), Ok(b)) => a == b,
                _ => *input == target,
            };
            if same {
                return Err(Error::config(format!(
                    "refusing to overwrite the input file {}",
                    input.display()
                )));
            }
        }
        let writer = if columns.is_empty() {
            Writer::standard()
        } else {
            Writer::new(columns)
        };
        let records = self.iter()?;
        writer.write_path(destination, records, make_tabix)
    }
}

/// One pass over a [`Reader`]'s input; yields `Result<Record>` lazily.
pub struct Records<'a> {
    lines: Option<LineSource>,
    parser: &'a Parser,
    pipeline: &'a Pipeline,
    errors: &'a RefCell<Vec<ErrorRecord>>,
    state: &'a Cell<ReaderState>,
    skip_errors: bool,
    max_errors: Option<usize>,
    yielded: usize,
    rejected: usize,
}

impl<'a> Records<'a> {
    /// Drop the input handle after a fatal error.
    fn fail(&mut self, error: Error) -> Option<Result<Record>> {
        self.lines = None;
        self.state.set(ReaderState::Closed);
        Some(Err(error))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self.lines.as_mut()?.next_line();
            let (line_number, line) = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.lines = None;
                    self.state.set(ReaderState::Exhausted);
                    info!(
                        records = self.yielded,
                        rejected = self.rejected,
                        "finished reading input"
                    );
                    return None;
                }
                Err(e) => return self.fail(e),
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.parser.parse(&line) {
                Ok(record) => match self.pipeline.apply(record) {
                    Ok(Some(record)) => {
                        self.yielded += 1;
                        return Some(Ok(record));
                    }
                    Ok(None) => continue,
                    Err(e) => return self.fail(e),
                },
                Err(Error::LineParse { message, line }) if self.skip_errors => {
                    warn!(line_number, %message, "skipping unparseable line");
                    self.errors.borrow_mut().push(ErrorRecord {
                        line_number,
                        message,
                        raw_line: line,
                    });
                    self.rejected += 1;
                    if let Some(max) = self.max_errors {
                        if self.rejected >= max {
                            let count = self.rejected;
                            return self.fail(Error::TooManyBadLines { count });
                        }
                    }
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<'a> FusedIterator for Records<'a> {}

impl<'a> Drop for Records<'a> {
    fn drop(&mut self) {
        if self.lines.take().is_some() {
            self.state.set(ReaderState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PvalueScale;

    fn config() -> ParserConfig {
        ParserConfig::builder()
            .chrom_col(1)
            .pos_col(2)
            .ref_col(3)
            .alt_col(4)
            .pvalue_col(5)
            .header_rows(1)
            .build()
            .unwrap()
    }

    fn lines() -> Vec<&'static str> {
        vec![
            "CHR\tPOS\tREF\tALT\tPVAL",
            "1\t100\tA\tG\t0.5",
            "1\t200\tC\tT\tnot-a-number",
            "",
            "2\t300\tG\tA\t0.01",
        ]
    }

    #[test]
    fn states_follow_the_pass() {
        let reader = Reader::from_lines(
            vec!["CHR\tPOS\tREF\tALT\tPVAL", "1\t1\tA\tC\t0.5"],
            config(),
        );
        assert_eq!(reader.state(), ReaderState::Unopened);
        {
            let mut records = reader.iter().unwrap();
            assert_eq!(reader.state(), ReaderState::Open);
            assert!(records.next().unwrap().is_ok());
            assert!(records.next().is_none());
            assert!(records.next().is_none());
        }
        assert_eq!(reader.state(), ReaderState::Exhausted);
        {
            let mut records = reader.iter().unwrap();
            records.next();
        }
        // abandoned mid-pass: the handle went with the cursor
        assert_eq!(reader.state(), ReaderState::Closed);

        // a closed reader can start over
        assert_eq!(reader.iter().unwrap().count(), 1);
        assert_eq!(reader.state(), ReaderState::Exhausted);
        reader.close();
        assert_eq!(reader.state(), ReaderState::Closed);
    }

    #[test]
    fn skip_errors_records_and_continues() {
        let reader = Reader::from_lines(lines(), config()).skip_errors(true);
        let records: Vec<Record> = reader.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        let errors = reader.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 3);
        assert_eq!(errors[0].raw_line, "1\t200\tC\tT\tnot-a-number");

        // a fresh pass starts with a clean error list
        let mut again = reader.iter().unwrap();
        assert!(reader.errors().is_empty());
        assert!(again.by_ref().all(|r| r.is_ok()));
        assert_eq!(reader.errors().len(), 1);
    }

    #[test]
    fn parse_errors_abort_by_default() {
        let reader = Reader::from_lines(lines(), config());
        let result: Result<Vec<Record>> = reader.iter().unwrap().collect();
        assert!(matches!(result, Err(Error::LineParse { .. })));
        assert_eq!(reader.state(), ReaderState::Closed);
        assert!(reader.errors().is_empty());
    }

    #[test]
    fn max_errors_stops_the_pass() {
        let reader = Reader::from_lines(lines(), config())
            .skip_errors(true)
            .max_errors(1);
        let result: Result<Vec<Record>> = reader.iter().unwrap().collect();
        assert!(matches!(result, Err(Error::TooManyBadLines { count: 1 })));
    }

    #[test]
    fn pipeline_errors_are_never_skipped() {
        let mut reader = Reader::from_lines(lines(), config()).skip_errors(true);
        reader.add_transform(|record| {
            if record.chrom() == "2" {
                anyhow::bail!("unexpected chromosome");
            }
            Ok(record)
        });
        let result: Result<Vec<Record>> = reader.iter().unwrap().collect();
        assert!(matches!(result, Err(Error::PipelineStage { .. })));
    }

    #[test]
    fn lookup_errors_are_never_skipped() {
        let mut reader = Reader::from_lines(lines(), config()).skip_errors(true);
        let lookup = |chrom: &str,
                      _: u32,
                      _: Option<&str>,
                      _: Option<&str>|
         -> anyhow::Result<Option<Value>> {
            anyhow::ensure!(chrom != "2", "lookup store has no chromosome {}", chrom);
            Ok(Some(Value::from("rs1")))
        };
        reader.add_lookup("rsid", lookup).unwrap();
        let mut records = reader.iter().unwrap();
        assert_eq!(
            records.next().unwrap().unwrap().get("rsid"),
            Value::from("rs1")
        );
        match records.next() {
            Some(Err(Error::PipelineStage { stage, source })) => {
                assert!(stage.contains("lookup `rsid`"));
                assert!(source.to_string().contains("no chromosome 2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(records.next().is_none());
        drop(records);
        // only the parse failure was recorded
        assert_eq!(reader.errors().len(), 1);
        assert_eq!(reader.state(), ReaderState::Closed);
    }

    #[test]
    fn failing_filters_end_the_pass() {
        let mut reader = Reader::from_lines(lines(), config()).skip_errors(true);
        reader.add_filter_fn("pvalue", |v| match v.as_f64() {
            Some(p) if p < 0.05 => anyhow::bail!("suspiciously small pvalue {}", p),
            _ => Ok(true),
        });
        let result: Result<Vec<Record>> = reader.iter().unwrap().collect();
        assert!(matches!(result, Err(Error::PipelineStage { .. })));
    }

    #[test]
    fn sniffs_on_first_use() {
        let reader = Reader::from_lines(
            vec!["#CHROM\tPOS\tREF\tALT\tLOG10_P", "3\t10\tA\tC\t2"],
            Sniffer::new(),
        );
        assert!(reader.parser().is_none());
        let records: Vec<Record> = reader.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert!((records[0].pvalue().unwrap() - 0.01).abs() < 1e-12);
        assert_eq!(
            reader.parser().unwrap().config().pvalue_scale(),
            PvalueScale::NegLog10
        );
    }

    #[test]
    fn unrecognized_input_refuses_to_proceed() {
        let reader = Reader::from_lines(vec!["a\tb", "x\ty"], Sniffer::new());
        assert!(matches!(reader.iter(), Err(Error::UnrecognizedFormat(_))));
    }

    #[test]
    fn lookups_cannot_target_identity_fields() {
        let mut reader = Reader::from_lines(lines(), config());
        let lookup = |_: &str,
                      _: u32,
                      _: Option<&str>,
                      _: Option<&str>|
         -> anyhow::Result<Option<Value>> { Ok(None) };
        assert!(reader.add_lookup("chrom", lookup).is_err());
        assert!(reader.add_lookup("rsid", lookup).is_ok());
    }

    #[test]
    fn missing_files_fail_on_first_access() {
        let reader = Reader::from_path("resources/does-not-exist.tsv", config());
        assert!(reader.iter().is_err());
    }
}
