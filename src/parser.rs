use getset::{CopyGetters, Getters};
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_till1, take_while1};
use nom::character::complete::{char, digit1, one_of};
use nom::combinator::{all_consuming, opt, rest};
use nom::sequence::{preceded, separated_pair, tuple};
use nom::IResult;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::types::{is_missing, ChromCase, Delimiter, PvalueScale, Value, MISSING_VALUES};

/// Immutable description of a delimited GWAS layout. Column indices are 0-based.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct ParserConfig {
    #[getset(get_copy = "pub")]
    delimiter: Delimiter,
    #[getset(get_copy = "pub")]
    chrom_col: Option<usize>,
    #[getset(get_copy = "pub")]
    pos_col: Option<usize>,
    #[getset(get_copy = "pub")]
    ref_col: Option<usize>,
    #[getset(get_copy = "pub")]
    alt_col: Option<usize>,
    #[getset(get_copy = "pub")]
    marker_col: Option<usize>,
    #[getset(get_copy = "pub")]
    pvalue_col: usize,
    #[getset(get_copy = "pub")]
    beta_col: Option<usize>,
    #[getset(get_copy = "pub")]
    stderr_beta_col: Option<usize>,
    #[getset(get_copy = "pub")]
    allele_freq_col: Option<usize>,
    #[getset(get_copy = "pub")]
    rsid_col: Option<usize>,
    /// Columns copied verbatim into the record's extra mapping.
    #[getset(get = "pub")]
    extra_cols: Vec<(usize, String)>,
    #[getset(get_copy = "pub")]
    pvalue_scale: PvalueScale,
    #[getset(get_copy = "pub")]
    chrom_case: ChromCase,
    /// Leading non-data lines (comments, column names).
    #[getset(get_copy = "pub")]
    header_rows: usize,
    /// Exact number of fields per line, when the layout width is known.
    #[getset(get_copy = "pub")]
    expected_fields: Option<usize>,
    #[getset(get = "pub")]
    missing_values: Vec<String>,
}

impl ParserConfig {
    pub fn builder() -> ParserConfigBuilder {
        ParserConfigBuilder::default()
    }

    /// The normalized layout produced by [`Writer::standard`](crate::Writer::standard):
    /// `#chrom pos ref alt neg_log_pvalue beta stderr_beta alt_allele_freq`.
    pub fn standard() -> Self {
        Self {
            delimiter: Delimiter::Tab,
            chrom_col: Some(0),
            pos_col: Some(1),
            ref_col: Some(2),
            alt_col: Some(3),
            marker_col: None,
            pvalue_col: 4,
            beta_col: Some(5),
            stderr_beta_col: Some(6),
            allele_freq_col: Some(7),
            rsid_col: None,
            extra_cols: Vec::new(),
            pvalue_scale: PvalueScale::NegLog10,
            chrom_case: ChromCase::Preserve,
            header_rows: 1,
            expected_fields: None,
            missing_values: default_missing_values(),
        }
    }

    /// Number of fields a line needs so that every configured column exists.
    fn required_width(&self) -> usize {
        [
            self.chrom_col,
            self.pos_col,
            self.ref_col,
            self.alt_col,
            self.marker_col,
            Some(self.pvalue_col),
            self.beta_col,
            self.stderr_beta_col,
            self.allele_freq_col,
            self.rsid_col,
        ]
        .iter()
        .flatten()
        .chain(self.extra_cols.iter().map(|(idx, _)| idx))
        .max()
        .map_or(0, |&max| max + 1)
    }
}

fn default_missing_values() -> Vec<String> {
    MISSING_VALUES.iter().map(|s| s.to_string()).collect()
}

/// Builds a [`ParserConfig`]. Column numbers are 1-based, as printed in file headers
/// and accepted on command lines.
#[derive(Debug, Clone, Default)]
pub struct ParserConfigBuilder {
    delimiter: Delimiter,
    chrom_col: Option<usize>,
    pos_col: Option<usize>,
    ref_col: Option<usize>,
    alt_col: Option<usize>,
    marker_col: Option<usize>,
    pvalue_col: Option<usize>,
    beta_col: Option<usize>,
    stderr_beta_col: Option<usize>,
    allele_freq_col: Option<usize>,
    rsid_col: Option<usize>,
    extra_cols: Vec<(usize, String)>,
    pvalue_scale: PvalueScale,
    chrom_case: ChromCase,
    header_rows: usize,
    expected_fields: Option<usize>,
    missing_values: Option<Vec<String>>,
}

impl ParserConfigBuilder {
    pub fn delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn chrom_col(mut self, col: usize) -> Self {
        self.chrom_col = Some(col);
        self
    }

    pub fn pos_col(mut self, col: usize) -> Self {
        self.pos_col = Some(col);
        self
    }

    pub fn ref_col(mut self, col: usize) -> Self {
        self.ref_col = Some(col);
        self
    }

    pub fn alt_col(mut self, col: usize) -> Self {
        self.alt_col = Some(col);
        self
    }

    /// A single `chrom:pos[_ref/alt]` column standing in for chrom/pos/ref/alt.
    pub fn marker_col(mut self, col: usize) -> Self {
        self.marker_col = Some(col);
        self
    }

    pub fn pvalue_col(mut self, col: usize) -> Self {
        self.pvalue_col = Some(col);
        self
    }

    pub fn beta_col(mut self, col: usize) -> Self {
        self.beta_col = Some(col);
        self
    }

    pub fn stderr_beta_col(mut self, col: usize) -> Self {
        self.stderr_beta_col = Some(col);
        self
    }

    pub fn allele_freq_col(mut self, col: usize) -> Self {
        self.allele_freq_col = Some(col);
        self
    }

    pub fn rsid_col(mut self, col: usize) -> Self {
        self.rsid_col = Some(col);
        self
    }

    pub fn extra_col<S: Into<String>>(mut self, col: usize, name: S) -> Self {
        self.extra_cols.push((col, name.into()));
        self
    }

    pub fn pvalue_scale(mut self, scale: PvalueScale) -> Self {
        self.pvalue_scale = scale;
        self
    }

    pub fn chrom_case(mut self, case: ChromCase) -> Self {
        self.chrom_case = case;
        self
    }

    pub fn header_rows(mut self, rows: usize) -> Self {
        self.header_rows = rows;
        self
    }

    pub fn expected_fields(mut self, fields: usize) -> Self {
        self.expected_fields = Some(fields);
        self
    }

    pub fn missing_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.missing_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<ParserConfig> {
        fn zero_based(name: &str, col: Option<usize>) -> Result<Option<usize>> {
            match col {
                Some(0) => Err(Error::config(format!(
                    "column numbers are 1-based; got 0 for `{}`",
                    name
                ))),
                Some(col) => Ok(Some(col - 1)),
                None => Ok(None),
            }
        }

        let has_position = self.marker_col.is_some()
            || (self.chrom_col.is_some() && self.pos_col.is_some());
        if !has_position {
            return Err(Error::config(
                "a marker column, or both chromosome and position columns, are required",
            ));
        }
        let pvalue_col = zero_based("pvalue", self.pvalue_col)?
            .ok_or_else(|| Error::config("a pvalue column is required"))?;
        let extra_cols = self
            .extra_cols
            .into_iter()
            .map(|(col, name)| {
                zero_based(&name, Some(col)).map(|idx| (idx.unwrap_or_default(), name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ParserConfig {
            delimiter: self.delimiter,
            chrom_col: zero_based("chrom", self.chrom_col)?,
            pos_col: zero_based("pos", self.pos_col)?,
            ref_col: zero_based("ref", self.ref_col)?,
            alt_col: zero_based("alt", self.alt_col)?,
            marker_col: zero_based("marker", self.marker_col)?,
            pvalue_col,
            beta_col: zero_based("beta", self.beta_col)?,
            stderr_beta_col: zero_based("stderr_beta", self.stderr_beta_col)?,
            allele_freq_col: zero_based("alt_allele_freq", self.allele_freq_col)?,
            rsid_col: zero_based("rsid", self.rsid_col)?,
            extra_cols,
            pvalue_scale: self.pvalue_scale,
            chrom_case: self.chrom_case,
            header_rows: self.header_rows,
            expected_fields: self.expected_fields,
            missing_values: self.missing_values.unwrap_or_else(default_missing_values),
        })
    }
}

/// Turns one line of text into a normalized [`Record`].
#[derive(Debug, Clone)]
pub struct Parser {
    config: ParserConfig,
    required_width: usize,
}

impl From<ParserConfig> for Parser {
    fn from(config: ParserConfig) -> Self {
        Parser::new(config)
    }
}

impl Parser {
    pub fn new(config: ParserConfig) -> Self {
        let required_width = config.required_width();
        Self {
            config,
            required_width,
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse one raw line. Fails with [`Error::LineParse`] carrying the line.
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::{Parser, ParserConfig, PvalueScale};
    ///
    /// let config = ParserConfig::builder()
    ///     .chrom_col(1)
    ///     .pos_col(2)
    ///     .ref_col(3)
    ///     .alt_col(4)
    ///     .pvalue_col(5)
    ///     .pvalue_scale(PvalueScale::NegLog10)
    ///     .build()
    ///     .unwrap();
    /// let parser = Parser::new(config);
    /// let record = parser.parse("chr7\t1400\ta\tg\t7.301").unwrap();
    /// assert_eq!(record.chrom(), "7");
    /// assert_eq!(record.alt_allele(), Some("G"));
    /// assert!((record.pvalue().unwrap() - 5e-8).abs() < 1e-10);
    /// ```
    pub fn parse(&self, line: &str) -> Result<Record> {
        self.parse_fields(line)
            .map_err(|message| Error::line_parse(message, line))
    }

    /// Chromosome and position of a line, without validating the other fields.
    /// `None` when either cannot be read.
    pub(crate) fn locate(&self, line: &str) -> Option<(String, u32)> {
        let config = &self.config;
        let fields = config
            .delimiter
            .split(line.trim_end_matches(|c| c == '\n' || c == '\r'));
        let (chrom, pos) = match config.marker_col {
            Some(idx) => {
                let (chrom, pos, _, _) = parse_marker(fields.get(idx)?).ok()?;
                (chrom, pos)
            }
            None => (
                *fields.get(config.chrom_col?)?,
                *fields.get(config.pos_col?)?,
            ),
        };
        let chrom = normalize_chrom(chrom, config.chrom_case, &config.missing_values).ok()?;
        let pos = parse_position(pos).ok()?;
        Some((chrom, pos))
    }

    fn parse_fields(&self, line: &str) -> std::result::Result<Record, String> {
        let config = &self.config;
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        let fields = config.delimiter.split(line);
        match config.expected_fields {
            Some(expected) if fields.len() != expected => {
                return Err(format!(
                    "expected {} fields but found {}",
                    expected,
                    fields.len()
                ))
            }
            _ if fields.len() < self.required_width => {
                return Err(format!(
                    "expected at least {} fields but found {}",
                    self.required_width,
                    fields.len()
                ))
            }
            _ => {}
        }
        let missing = &config.missing_values;

        // identity: either a marker column or explicit chrom/pos columns,
        // with explicit allele columns taking precedence over marker alleles
        let (chrom, pos, mut ref_allele, mut alt_allele) = match config.marker_col {
            Some(idx) => parse_marker(fields[idx])?,
            None => (
                field(&fields, config.chrom_col),
                field(&fields, config.pos_col),
                None,
                None,
            ),
        };
        if let Some(raw) = config.ref_col.map(|idx| fields[idx]) {
            if !is_missing(raw.trim(), missing) {
                ref_allele = Some(raw);
            }
        }
        if let Some(raw) = config.alt_col.map(|idx| fields[idx]) {
            if !is_missing(raw.trim(), missing) {
                alt_allele = Some(raw);
            }
        }
        let ref_allele = ref_allele.filter(|a| !is_missing(a.trim(), missing));
        let alt_allele = alt_allele.filter(|a| !is_missing(a.trim(), missing));

        let chrom = normalize_chrom(chrom, config.chrom_case, missing)?;
        let pos = parse_position(pos)?;
        let mut record = Record::new(chrom, pos, ref_allele, alt_allele)
            .map_err(|e| e.to_string())?;

        let pvalue = parse_pvalue(fields[config.pvalue_col], config.pvalue_scale, missing)?;
        record.set_pvalue(pvalue).map_err(|e| e.to_string())?;
        record.set_beta(optional_float(&fields, config.beta_col, "beta", missing)?);
        record.set_stderr_beta(optional_float(
            &fields,
            config.stderr_beta_col,
            "stderr_beta",
            missing,
        )?);
        record.set_alt_allele_freq(optional_float(
            &fields,
            config.allele_freq_col,
            "alt_allele_freq",
            missing,
        )?);

        if let Some(idx) = config.rsid_col {
            record.insert_extra("rsid", Value::from_field(fields[idx], missing));
        }
        for (idx, name) in &config.extra_cols {
            record.insert_extra(name, Value::from_field(fields[*idx], missing));
        }
        Ok(record)
    }
}

fn field<'a>(fields: &[&'a str], idx: Option<usize>) -> &'a str {
    idx.map_or("", |idx| fields[idx])
}

/// Strip a leading `chr`/`CHR` and apply the case policy.
pub(crate) fn normalize_chrom<S: AsRef<str>>(
    raw: &str,
    case: ChromCase,
    missing: &[S],
) -> std::result::Result<String, String> {
    let raw = raw.trim();
    if is_missing(raw, missing) {
        return Err("chromosome is missing".to_owned());
    }
    let stripped = match raw.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") && raw.len() > 3 => &raw[3..],
        _ => raw,
    };
    Ok(match case {
        ChromCase::Preserve => stripped.to_owned(),
        ChromCase::Upper => stripped.to_ascii_uppercase(),
    })
}

fn parse_position(raw: &str) -> std::result::Result<u32, String> {
    match raw.trim().parse::<u32>() {
        Ok(0) => Err("position must be at least 1".to_owned()),
        Ok(pos) => Ok(pos),
        Err(_) => Err(format!("position `{}` is not a positive integer", raw.trim())),
    }
}

/// Parse a p-value field into linear space, rejecting anything outside `(0, 1]`.
pub(crate) fn parse_pvalue<S: AsRef<str>>(
    raw: &str,
    scale: PvalueScale,
    missing: &[S],
) -> std::result::Result<Option<f64>, String> {
    let raw = raw.trim();
    if is_missing(raw, missing) {
        return Ok(None);
    }
    let value = raw
        .parse::<f64>()
        .map_err(|_| format!("pvalue `{}` is not a number", raw))?;
    if value.is_nan() {
        return Err(format!("pvalue `{}` is not a number", raw));
    }
    let pvalue = match scale {
        PvalueScale::Linear => value,
        PvalueScale::NegLog10 => 10f64.powf(-value),
    };
    if pvalue > 0.0 && pvalue <= 1.0 {
        Ok(Some(pvalue))
    } else {
        Err(format!(
            "pvalue `{}` ({} scale) is outside (0, 1] after conversion",
            raw, scale
        ))
    }
}

fn optional_float<S: AsRef<str>>(
    fields: &[&str],
    idx: Option<usize>,
    name: &str,
    missing: &[S],
) -> std::result::Result<Option<f64>, String> {
    let raw = match idx {
        Some(idx) => fields[idx].trim(),
        None => return Ok(None),
    };
    if is_missing(raw, missing) {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| format!("{} `{}` is not a number", name, raw))
}

type Marker<'a> = (&'a str, &'a str, Option<&'a str>, Option<&'a str>);

fn is_allele_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*'
}

// chr1:12345, 1:12345_A/G, 1:12345:A:G, 1:12345_A/G_rs123 (trailing annotation ignored)
fn marker(input: &str) -> IResult<&str, Marker<'_>> {
    let (input, _) = opt(tag_no_case("chr"))(input)?;
    let (input, (chrom, _, pos)) =
        tuple((take_till1(|c: char| c == ':'), char(':'), digit1))(input)?;
    let (input, alleles) = opt(preceded(
        one_of("_:"),
        separated_pair(
            take_while1(is_allele_char),
            one_of("/:|"),
            take_while1(is_allele_char),
        ),
    ))(input)?;
    let (input, _) = opt(preceded(alt((char('_'), char(':'))), rest))(input)?;
    let (ref_allele, alt_allele) = match alleles {
        Some((r, a)) => (Some(r), Some(a)),
        None => (None, None),
    };
    Ok((input, (chrom, pos, ref_allele, alt_allele)))
}

fn parse_marker(raw: &str) -> std::result::Result<Marker<'_>, String> {
    all_consuming(marker)(raw.trim())
        .map(|(_, parsed)| parsed)
        .map_err(|_| {
            format!(
                "marker `{}` is not of the form chrom:pos or chrom:pos_ref/alt",
                raw.trim()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic() -> Parser {
        Parser::new(
            ParserConfig::builder()
                .chrom_col(1)
                .pos_col(2)
                .ref_col(3)
                .alt_col(4)
                .pvalue_col(5)
                .pvalue_scale(PvalueScale::NegLog10)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_parse_is_deterministic() {
        let parser = basic();
        let line = "X\t2700000\tG\tA\t3.2";
        assert_eq!(parser.parse(line).unwrap(), parser.parse(line).unwrap());
    }

    #[test]
    fn test_neg_log_conversion() {
        let record = basic().parse("1\t100\tA\tC\t7.301").unwrap();
        let p = record.pvalue().unwrap();
        assert!((p - 5.0e-8).abs() / 5.0e-8 < 1e-3);
        assert!((record.neg_log_pvalue().unwrap() - 7.301).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_out_of_range_pvalues() {
        let parser = Parser::new(
            ParserConfig::builder()
                .chrom_col(1)
                .pos_col(2)
                .pvalue_col(3)
                .build()
                .unwrap(),
        );
        assert!(parser.parse("1\t100\t0").is_err());
        assert!(parser.parse("1\t100\t1.5").is_err());
        assert!(parser.parse("1\t100\t-0.1").is_err());
        assert!(parser.parse("1\t100\tsmall").is_err());
        assert_eq!(parser.parse("1\t100\t1").unwrap().pvalue(), Some(1.0));
        // a negative -log10 value would be p > 1
        assert!(basic().parse("1\t100\tA\tC\t-1").is_err());
        // underflows to exactly zero
        assert!(basic().parse("1\t100\tA\tC\t400").is_err());
    }

    #[test]
    fn test_missing_pvalue_is_absent() {
        let record = basic().parse("1\t100\tA\tC\tNA").unwrap();
        assert_eq!(record.pvalue(), None);
    }

    #[test]
    fn test_line_errors_carry_the_line() {
        match basic().parse("1\tabc\tA\tC\t0.5") {
            Err(Error::LineParse { message, line }) => {
                assert!(message.contains("position"));
                assert_eq!(line, "1\tabc\tA\tC\t0.5");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(basic().parse("1\t100\tA").is_err());
        assert!(basic().parse("1\t0\tA\tC\t1").is_err());
    }

    #[test]
    fn test_chrom_and_allele_normalization() {
        let record = basic().parse("CHR2\t5\tac\t.\t1").unwrap();
        assert_eq!(record.chrom(), "2");
        assert_eq!(record.ref_allele(), Some("AC"));
        assert_eq!(record.alt_allele(), None);

        let upper = Parser::new(
            ParserConfig::builder()
                .chrom_col(1)
                .pos_col(2)
                .pvalue_col(3)
                .chrom_case(ChromCase::Upper)
                .build()
                .unwrap(),
        );
        assert_eq!(upper.parse("chrx\t5\t0.5").unwrap().chrom(), "X");
        assert!(upper.parse("NA\t5\t0.5").is_err());
    }

    #[test]
    fn test_optional_fields_distinguish_absent_from_zero() {
        let parser = Parser::new(
            ParserConfig::builder()
                .chrom_col(1)
                .pos_col(2)
                .pvalue_col(3)
                .beta_col(4)
                .stderr_beta_col(5)
                .build()
                .unwrap(),
        );
        let record = parser.parse("1\t10\t0.5\t0\tNA").unwrap();
        assert_eq!(record.beta(), Some(0.0));
        assert_eq!(record.stderr_beta(), None);
        assert!(parser.parse("1\t10\t0.5\tbig\t1").is_err());
    }

    #[test]
    fn test_marker_column() {
        let parser = Parser::new(
            ParserConfig::builder()
                .marker_col(1)
                .pvalue_col(2)
                .build()
                .unwrap(),
        );
        let record = parser.parse("chr1:12345_a/g_rs99\t0.01").unwrap();
        assert_eq!(record.chrom(), "1");
        assert_eq!(record.pos(), 12345);
        assert_eq!(record.ref_allele(), Some("A"));
        assert_eq!(record.alt_allele(), Some("G"));

        let record = parser.parse("X:500:C:T\t0.01").unwrap();
        assert_eq!(record.chrom(), "X");
        assert_eq!(record.alt_allele(), Some("T"));

        let record = parser.parse("22:7\t0.01").unwrap();
        assert_eq!(record.ref_allele(), None);

        assert!(parser.parse("nonsense\t0.01").is_err());
    }

    #[test]
    fn test_locate_reads_only_identity() {
        let parser = basic();
        assert_eq!(
            parser.locate("chr3\t120\tA\tC\tnot-a-pvalue"),
            Some(("3".to_owned(), 120))
        );
        assert_eq!(parser.locate("3\tabc\tA\tC\t1"), None);
        assert_eq!(parser.locate("3"), None);

        let markers = Parser::new(
            ParserConfig::builder()
                .marker_col(1)
                .pvalue_col(2)
                .build()
                .unwrap(),
        );
        assert_eq!(
            markers.locate("X:500_C/T\t0"),
            Some(("X".to_owned(), 500))
        );
    }

    #[test]
    fn test_extra_columns_are_preserved() {
        let parser = Parser::new(
            ParserConfig::builder()
                .chrom_col(1)
                .pos_col(2)
                .pvalue_col(3)
                .rsid_col(4)
                .extra_col(5, "n_samples")
                .build()
                .unwrap(),
        );
        let record = parser.parse("1\t10\t0.5\trs42\t1200").unwrap();
        assert_eq!(record.get("rsid"), Value::from("rs42"));
        assert_eq!(record.get("n_samples"), Value::Int(1200));
    }

    #[test]
    fn test_builder_validation() {
        assert!(ParserConfig::builder().pvalue_col(3).build().is_err());
        assert!(ParserConfig::builder()
            .chrom_col(1)
            .pos_col(2)
            .build()
            .is_err());
        assert!(ParserConfig::builder()
            .chrom_col(0)
            .pos_col(2)
            .pvalue_col(3)
            .build()
            .is_err());
    }

    #[test]
    fn test_expected_field_count() {
        let parser = Parser::new(
            ParserConfig::builder()
                .chrom_col(1)
                .pos_col(2)
                .pvalue_col(3)
                .expected_fields(4)
                .build()
                .unwrap(),
        );
        assert!(parser.parse("1\t10\t0.5\tx").is_ok());
        assert!(parser.parse("1\t10\t0.5").is_err());
        assert!(parser.parse("1\t10\t0.5\tx\ty").is_err());
    }
}
