use tracing::debug;

use crate::error::{Error, Result};
use crate::parser::{ParserConfig, ParserConfigBuilder};
use crate::types::{Delimiter, PvalueScale, MISSING_VALUES};

/// Column names of one upstream tool's output. Roles that a layout lacks are `None`.
#[derive(Debug, Clone, Copy)]
struct Layout {
    name: &'static str,
    delimiters: &'static [Delimiter],
    /// Every one of these header tokens must be present for the layout to match.
    required: &'static [&'static str],
    chrom: Option<&'static str>,
    pos: Option<&'static str>,
    ref_allele: Option<&'static str>,
    alt_allele: Option<&'static str>,
    marker: Option<&'static str>,
    pvalue: &'static str,
    scale: PvalueScale,
    beta: Option<&'static str>,
    stderr_beta: Option<&'static str>,
    allele_freq: Option<&'static str>,
    rsid: Option<&'static str>,
}

const TAB: &[Delimiter] = &[Delimiter::Tab];
const ANY: &[Delimiter] = &[Delimiter::Tab, Delimiter::Comma, Delimiter::Whitespace];
const WHITESPACE: &[Delimiter] = &[Delimiter::Whitespace, Delimiter::Tab];

const BASE: Layout = Layout {
    name: "",
    delimiters: TAB,
    required: &[],
    chrom: Some("CHROM"),
    pos: Some("POS"),
    ref_allele: Some("REF"),
    alt_allele: Some("ALT"),
    marker: None,
    pvalue: "",
    scale: PvalueScale::Linear,
    beta: None,
    stderr_beta: None,
    allele_freq: None,
    rsid: None,
};

/// Known layouts, in priority order: the first one whose required tokens are all
/// present in the header wins.
const LAYOUTS: &[Layout] = &[
    Layout {
        name: "standard",
        required: &["chrom", "pos", "ref", "alt", "neg_log_pvalue"],
        pvalue: "neg_log_pvalue",
        scale: PvalueScale::NegLog10,
        beta: Some("beta"),
        stderr_beta: Some("stderr_beta"),
        allele_freq: Some("alt_allele_freq"),
        rsid: Some("rsid"),
        ..BASE
    },
    Layout {
        name: "plink2-log10",
        required: &["CHROM", "POS", "REF", "ALT", "LOG10_P"],
        pvalue: "LOG10_P",
        scale: PvalueScale::NegLog10,
        beta: Some("BETA"),
        stderr_beta: Some("SE"),
        rsid: Some("ID"),
        ..BASE
    },
    Layout {
        name: "plink2",
        required: &["CHROM", "POS", "REF", "ALT", "P"],
        pvalue: "P",
        beta: Some("BETA"),
        stderr_beta: Some("SE"),
        rsid: Some("ID"),
        ..BASE
    },
    Layout {
        name: "raremetalworker",
        required: &["CHROM", "POS", "REF", "ALT", "ALL_AF", "U_STAT", "PVALUE"],
        pvalue: "PVALUE",
        beta: Some("ALT_EFFSIZE"),
        allele_freq: Some("ALL_AF"),
        ..BASE
    },
    Layout {
        name: "rvtests",
        required: &["CHROM", "POS", "REF", "ALT", "AF", "U_STAT", "PVALUE"],
        pvalue: "PVALUE",
        allele_freq: Some("AF"),
        ..BASE
    },
    Layout {
        name: "raremetal",
        required: &["CHROM", "POS", "REF", "ALT", "POOLED_ALT_AF", "PVALUE"],
        pvalue: "PVALUE",
        beta: Some("EFFECT_SIZE"),
        stderr_beta: Some("EFFECT_SIZE_SD"),
        allele_freq: Some("POOLED_ALT_AF"),
        ..BASE
    },
    Layout {
        name: "epacts",
        required: &["CHROM", "BEGIN", "MARKER_ID", "PVALUE"],
        chrom: None,
        pos: None,
        ref_allele: None,
        alt_allele: None,
        marker: Some("MARKER_ID"),
        pvalue: "PVALUE",
        beta: Some("BETA"),
        stderr_beta: Some("SEBETA"),
        allele_freq: Some("MAF"),
        ..BASE
    },
    Layout {
        name: "saige",
        delimiters: ANY,
        required: &["CHR", "POS", "Allele1", "Allele2", "p.value"],
        chrom: Some("CHR"),
        ref_allele: Some("Allele1"),
        alt_allele: Some("Allele2"),
        pvalue: "p.value",
        beta: Some("BETA"),
        stderr_beta: Some("SE"),
        allele_freq: Some("AF_Allele2"),
        rsid: Some("SNPID"),
        ..BASE
    },
    Layout {
        name: "bolt-lmm",
        required: &["SNP", "CHR", "BP", "ALLELE1", "ALLELE0", "P_BOLT_LMM"],
        chrom: Some("CHR"),
        pos: Some("BP"),
        ref_allele: Some("ALLELE0"),
        alt_allele: Some("ALLELE1"),
        pvalue: "P_BOLT_LMM",
        beta: Some("BETA"),
        stderr_beta: Some("SE"),
        allele_freq: Some("A1FREQ"),
        rsid: Some("SNP"),
        ..BASE
    },
    Layout {
        name: "plink",
        delimiters: WHITESPACE,
        required: &["CHR", "SNP", "BP", "A1", "A2", "P"],
        chrom: Some("CHR"),
        pos: Some("BP"),
        ref_allele: Some("A2"),
        alt_allele: Some("A1"),
        pvalue: "P",
        beta: Some("BETA"),
        stderr_beta: Some("SE"),
        rsid: Some("SNP"),
        ..BASE
    },
    Layout {
        name: "plink",
        delimiters: WHITESPACE,
        required: &["CHR", "SNP", "BP", "A1", "P"],
        chrom: Some("CHR"),
        pos: Some("BP"),
        ref_allele: None,
        alt_allele: Some("A1"),
        pvalue: "P",
        beta: Some("BETA"),
        stderr_beta: Some("SE"),
        rsid: Some("SNP"),
        ..BASE
    },
    Layout {
        name: "generic",
        delimiters: ANY,
        required: &["CHR", "POS", "REF", "ALT", "PVAL"],
        chrom: Some("CHR"),
        pvalue: "PVAL",
        ..BASE
    },
];

/// Column names chosen by the caller. Names are matched against the header like the
/// built-in layouts (case-insensitive, leading `#` ignored).
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    pub chrom: Option<String>,
    pub pos: Option<String>,
    pub ref_allele: Option<String>,
    pub alt_allele: Option<String>,
    pub marker: Option<String>,
    pub pvalue: Option<String>,
    pub pvalue_scale: PvalueScale,
    pub beta: Option<String>,
    pub stderr_beta: Option<String>,
    pub allele_freq: Option<String>,
    pub rsid: Option<String>,
}

/// A numeric-looking field; missing sentinels count as data, not as column names.
pub fn is_numeric(value: &str) -> bool {
    MISSING_VALUES.contains(&value) || value.trim().parse::<f64>().is_ok()
}

/// A line is a header if it is a comment, or if none of its fields look like data.
///
/// # Examples
///
/// ```
/// use sumstats::sniffer::is_header;
/// use sumstats::Delimiter;
///
/// assert!(is_header("#chrom\tpos", "#", Delimiter::Tab));
/// assert!(is_header("CHR\tPOS\tPVAL", "#", Delimiter::Tab));
/// assert!(!is_header("1\t100\t0.5", "#", Delimiter::Tab));
/// ```
pub fn is_header(row: &str, comment: &str, delimiter: Delimiter) -> bool {
    row.starts_with(comment) || delimiter.split(row).iter().all(|f| !is_numeric(f))
}

fn normalize_token(token: &str) -> String {
    token.trim().trim_start_matches('#').trim().to_ascii_lowercase()
}

/// Detects a [`ParserConfig`] from the first lines of a file.
#[derive(Debug, Clone, Default)]
pub struct Sniffer {
    mapping: Option<ColumnMapping>,
}

impl Sniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve these column names instead of consulting the built-in registry.
    pub fn with_mapping(mapping: ColumnMapping) -> Self {
        Self {
            mapping: Some(mapping),
        }
    }

    pub fn detect<S: AsRef<str>>(&self, lines: &[S]) -> Result<ParserConfig> {
        self.detect_layout(lines).map(|(_, config)| config)
    }

    /// Like [`detect`](Self::detect), also returning the name of the matched layout
    /// (`"custom"` for an explicit mapping).
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::Sniffer;
    ///
    /// let lines = ["CHR\tPOS\tREF\tALT\tPVAL", "1\t100\tA\tG\t0.01"];
    /// let (name, config) = Sniffer::new().detect_layout(&lines).unwrap();
    /// assert_eq!(name, "generic");
    /// assert_eq!(config.header_rows(), 1);
    /// ```
    pub fn detect_layout<S: AsRef<str>>(
        &self,
        lines: &[S],
    ) -> Result<(&'static str, ParserConfig)> {
        let (header_rows, columns_line) = header_block(lines)?;

        let candidates: Vec<(Delimiter, Vec<String>)> =
            [Delimiter::Tab, Delimiter::Comma, Delimiter::Whitespace]
                .iter()
                .map(|&d| (d, d.split(columns_line).into_iter().map(normalize_token).collect()))
                .collect();

        if let Some(mapping) = &self.mapping {
            let guess = Delimiter::guess(columns_line);
            let tokens = candidates
                .iter()
                .find(|(d, _)| *d == guess)
                .map(|(_, t)| t.clone())
                .unwrap_or_default();
            let config = from_mapping(mapping, guess, &tokens, header_rows)?;
            debug!(delimiter = %guess, header_rows, "using explicit column mapping");
            return Ok(("custom", config));
        }

        for layout in LAYOUTS {
            for &delimiter in layout.delimiters {
                let tokens = match candidates.iter().find(|(d, _)| *d == delimiter) {
                    Some((_, tokens)) => tokens,
                    None => continue,
                };
                let matches = layout
                    .required
                    .iter()
                    .all(|r| tokens.iter().any(|t| *t == r.to_ascii_lowercase()));
                if matches {
                    let config = from_layout(layout, delimiter, tokens, header_rows)?;
                    debug!(
                        layout = layout.name,
                        delimiter = %delimiter,
                        header_rows,
                        "detected file layout"
                    );
                    return Ok((layout.name, config));
                }
            }
        }
        Err(Error::UnrecognizedFormat(columns_line.to_owned()))
    }
}

/// Count leading header rows and return the last one, which names the columns.
fn header_block<S: AsRef<str>>(lines: &[S]) -> Result<(usize, &str)> {
    let mut header_rows = 0;
    let mut columns = None;
    for line in lines {
        let line = line.as_ref().trim_end_matches(|c| c == '\r' || c == '\n');
        let delimiter = Delimiter::guess(line);
        if line.trim().is_empty() {
            header_rows += 1;
        } else if is_header(line, "#", delimiter) {
            header_rows += 1;
            columns = Some(line);
        } else {
            break;
        }
    }
    match columns {
        Some(columns) => Ok((header_rows, columns)),
        None => Err(Error::UnrecognizedFormat(
            lines
                .first()
                .map(|l| l.as_ref().to_owned())
                .unwrap_or_default(),
        )),
    }
}

/// Assigns header columns to record roles; columns not claimed by a role are kept
/// as extra fields under their lowercased header name.
struct Assignment<'a> {
    tokens: &'a [String],
    claimed: Vec<bool>,
}

impl<'a> Assignment<'a> {
    fn new(tokens: &'a [String]) -> Self {
        Self {
            tokens,
            claimed: vec![false; tokens.len()],
        }
    }

    /// 1-based column number for a header name.
    fn claim(&mut self, name: Option<&str>) -> Option<usize> {
        let wanted = normalize_token(name?);
        let idx = self.tokens.iter().position(|t| *t == wanted)?;
        self.claimed[idx] = true;
        Some(idx + 1)
    }

    fn claim_required(&mut self, role: &str, name: Option<&str>) -> Result<Option<usize>> {
        match name {
            None => Ok(None),
            Some(n) => self.claim(Some(n)).map(Some).ok_or_else(|| {
                Error::config(format!("column `{}` for {} is not in the header", n, role))
            }),
        }
    }

    fn finish(self, mut builder: ParserConfigBuilder) -> ParserConfigBuilder {
        for (idx, claimed) in self.claimed.iter().enumerate() {
            if !claimed {
                builder = builder.extra_col(idx + 1, self.tokens[idx].as_str());
            }
        }
        builder.expected_fields(self.tokens.len())
    }
}

type SetColumn = fn(ParserConfigBuilder, usize) -> ParserConfigBuilder;

fn apply(builder: ParserConfigBuilder, col: Option<usize>, set: SetColumn) -> ParserConfigBuilder {
    match col {
        Some(col) => set(builder, col),
        None => builder,
    }
}

fn from_layout(
    layout: &Layout,
    delimiter: Delimiter,
    tokens: &[String],
    header_rows: usize,
) -> Result<ParserConfig> {
    let mut cols = Assignment::new(tokens);
    let mut builder = ParserConfig::builder()
        .delimiter(delimiter)
        .pvalue_scale(layout.scale)
        .header_rows(header_rows);
    builder = apply(builder, cols.claim(layout.marker), ParserConfigBuilder::marker_col);
    builder = apply(builder, cols.claim(layout.chrom), ParserConfigBuilder::chrom_col);
    builder = apply(builder, cols.claim(layout.pos), ParserConfigBuilder::pos_col);
    builder = apply(builder, cols.claim(layout.ref_allele), ParserConfigBuilder::ref_col);
    builder = apply(builder, cols.claim(layout.alt_allele), ParserConfigBuilder::alt_col);
    builder = apply(builder, cols.claim(Some(layout.pvalue)), ParserConfigBuilder::pvalue_col);
    builder = apply(builder, cols.claim(layout.beta), ParserConfigBuilder::beta_col);
    builder = apply(builder, cols.claim(layout.stderr_beta), ParserConfigBuilder::stderr_beta_col);
    builder = apply(builder, cols.claim(layout.allele_freq), ParserConfigBuilder::allele_freq_col);
    builder = apply(builder, cols.claim(layout.rsid), ParserConfigBuilder::rsid_col);
    if layout.marker.is_some() {
        // EPACTS repeats chrom/begin/end next to the marker; the marker is authoritative
        cols.claim(Some("CHROM"));
        cols.claim(Some("BEGIN"));
        cols.claim(Some("END"));
    }
    builder = cols.finish(builder);
    builder.build()
}

fn from_mapping(
    mapping: &ColumnMapping,
    delimiter: Delimiter,
    tokens: &[String],
    header_rows: usize,
) -> Result<ParserConfig> {
    let mut cols = Assignment::new(tokens);
    let mut builder = ParserConfig::builder()
        .delimiter(delimiter)
        .pvalue_scale(mapping.pvalue_scale)
        .header_rows(header_rows);
    let roles: [(&str, &Option<String>, SetColumn); 10] = [
        ("marker", &mapping.marker, ParserConfigBuilder::marker_col),
        ("chrom", &mapping.chrom, ParserConfigBuilder::chrom_col),
        ("pos", &mapping.pos, ParserConfigBuilder::pos_col),
        ("ref", &mapping.ref_allele, ParserConfigBuilder::ref_col),
        ("alt", &mapping.alt_allele, ParserConfigBuilder::alt_col),
        ("pvalue", &mapping.pvalue, ParserConfigBuilder::pvalue_col),
        ("beta", &mapping.beta, ParserConfigBuilder::beta_col),
        ("stderr_beta", &mapping.stderr_beta, ParserConfigBuilder::stderr_beta_col),
        ("alt_allele_freq", &mapping.allele_freq, ParserConfigBuilder::allele_freq_col),
        ("rsid", &mapping.rsid, ParserConfigBuilder::rsid_col),
    ];
    for (role, name, set) in roles {
        let col = cols.claim_required(role, name.as_deref())?;
        builder = apply(builder, col, set);
    }
    builder = cols.finish(builder);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sniff(lines: &[&str]) -> (&'static str, ParserConfig) {
        Sniffer::new().detect_layout(lines).unwrap()
    }

    #[test]
    fn numeric_fields_and_missing_values() {
        assert!(is_numeric("1.5e-8"));
        assert!(is_numeric("NA"));
        assert!(!is_numeric("PVAL"));
        assert!(is_header("#comment line", "#", Delimiter::Tab));
        assert!(!is_header("X\t100\tNA", "#", Delimiter::Tab));
    }

    #[test]
    fn counts_comment_rows_before_the_column_names() {
        let (name, config) = sniff(&[
            "## produced by some tool",
            "#CHROM\tPOS\tREF\tALT\tP",
            "1\t100\tA\tG\t0.5",
        ]);
        assert_eq!(name, "plink2");
        assert_eq!(config.header_rows(), 2);
        assert_eq!(config.pvalue_col(), 4);
    }

    #[test]
    fn registry_order_is_priority_order() {
        // carries both LOG10_P and P; the -log10 layout is listed first
        let (name, config) = sniff(&["#CHROM\tPOS\tREF\tALT\tP\tLOG10_P", "1\t1\tA\tC\t0.1\t1"]);
        assert_eq!(name, "plink2-log10");
        assert_eq!(config.pvalue_scale(), PvalueScale::NegLog10);
        assert_eq!(config.pvalue_col(), 5);
        assert_eq!(config.extra_cols(), &vec![(4, "p".to_owned())]);
    }

    #[test]
    fn detects_standard_output() {
        let (name, config) = sniff(&[
            "#chrom\tpos\tref\talt\tneg_log_pvalue\tbeta\tstderr_beta\talt_allele_freq",
            "1\t762320\tC\tT\t0.423\t0.1\t0.2\t0.01",
        ]);
        assert_eq!(name, "standard");
        assert_eq!(config.beta_col(), Some(5));
        assert_eq!(config.expected_fields(), Some(8));
    }

    #[test]
    fn detects_whitespace_plink() {
        let (name, config) = sniff(&[
            " CHR        SNP         BP   A1      TEST    NMISS       BETA         STAT       P ",
            "   1   rs3094315     752566    G       ADD     3466    -0.0085     -0.3547  0.7228",
        ]);
        assert_eq!(name, "plink");
        assert_eq!(config.delimiter(), Delimiter::Whitespace);
        assert_eq!(config.ref_col(), None);
        assert_eq!(config.alt_col(), Some(3));
        assert_eq!(config.rsid_col(), Some(1));
    }

    #[test]
    fn detects_epacts_marker_layout() {
        let (name, config) = sniff(&[
            "#CHROM\tBEGIN\tEND\tMARKER_ID\tNS\tAC\tCALLRATE\tMAF\tPVALUE\tBETA\tSEBETA",
            "1\t762320\t762320\t1:762320_C/T_rs75333668\t4\t0\t1\t0\tNA\tNA\tNA",
        ]);
        assert_eq!(name, "epacts");
        assert_eq!(config.marker_col(), Some(3));
        assert_eq!(config.chrom_col(), None);
        let extras: Vec<&str> = config.extra_cols().iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(extras, vec!["ns", "ac", "callrate"]);
    }

    #[test]
    fn unknown_headers_are_rejected() {
        let err = Sniffer::new()
            .detect(&["foo\tbar\tbaz", "a\tb\tc"])
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat(_)));
        let err = Sniffer::new().detect(&["1\t100\t0.5"]).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat(_)));
    }

    #[test]
    fn explicit_mapping_takes_precedence() {
        let mapping = ColumnMapping {
            chrom: Some("chromosome".into()),
            pos: Some("position".into()),
            pvalue: Some("p".into()),
            ..ColumnMapping::default()
        };
        let config = Sniffer::with_mapping(mapping)
            .detect(&["chromosome,position,p,note", "1,100,0.5,x"])
            .unwrap();
        assert_eq!(config.delimiter(), Delimiter::Comma);
        assert_eq!(config.chrom_col(), Some(0));
        assert_eq!(config.pvalue_col(), 2);
        assert_eq!(config.extra_cols(), &vec![(3, "note".to_owned())]);

        let missing = ColumnMapping {
            chrom: Some("chromosome".into()),
            pos: Some("nope".into()),
            pvalue: Some("p".into()),
            ..ColumnMapping::default()
        };
        assert!(matches!(
            Sniffer::with_mapping(missing).detect(&["chromosome,position,p"]),
            Err(Error::Configuration(_))
        ));
    }
}
