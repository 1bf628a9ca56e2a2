use std::str::FromStr;

use indexmap::IndexMap;
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::error::{Error, Result};
use crate::types::Value;

/// Field names every record answers to; everything else lives in the extra mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum KnownField {
    Chrom,
    Pos,
    Ref,
    Alt,
    Pvalue,
    NegLogPvalue,
    Beta,
    StderrBeta,
    AltAlleleFreq,
    Marker,
}

impl KnownField {
    /// Fields fixed at parse time (or derived from them).
    pub fn is_identity(self) -> bool {
        matches!(
            self,
            KnownField::Chrom
                | KnownField::Pos
                | KnownField::Ref
                | KnownField::Alt
                | KnownField::Marker
        )
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        KnownField::iter().map(<&'static str>::from)
    }
}

/// Columns of the normalized output layout, in order.
pub const DEFAULT_COLUMNS: [&str; 8] = [
    "chrom",
    "pos",
    "ref",
    "alt",
    "neg_log_pvalue",
    "beta",
    "stderr_beta",
    "alt_allele_freq",
];

/// One normalized variant observation.
///
/// Identity (`chrom`, `pos`, `ref`, `alt`) is fixed at construction. Statistical fields
/// and the extra-field mapping can be updated by transforms and lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    chrom: String,
    pos: u32,
    ref_allele: Option<String>,
    alt_allele: Option<String>,
    pvalue: Option<f64>,
    beta: Option<f64>,
    stderr_beta: Option<f64>,
    alt_allele_freq: Option<f64>,
    extra: IndexMap<String, Value>,
}

impl Record {
    /// Build a record from already-normalized identity fields.
    ///
    /// Alleles are uppercased; `.` and `-` mean "unknown allele".
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::Record;
    ///
    /// let record = Record::new("1", 100, Some("a"), Some("-")).unwrap();
    /// assert_eq!(record.ref_allele(), Some("A"));
    /// assert_eq!(record.alt_allele(), None);
    /// assert!(Record::new("1", 0, None, None).is_err());
    /// ```
    pub fn new<S: Into<String>>(
        chrom: S,
        pos: u32,
        ref_allele: Option<&str>,
        alt_allele: Option<&str>,
    ) -> Result<Self> {
        let chrom = chrom.into();
        if chrom.is_empty() {
            return Err(Error::config("chromosome name cannot be empty"));
        }
        if pos == 0 {
            return Err(Error::config("positions are 1-based; got 0"));
        }
        Ok(Self {
            chrom,
            pos,
            ref_allele: ref_allele.and_then(normalize_allele),
            alt_allele: alt_allele.and_then(normalize_allele),
            pvalue: None,
            beta: None,
            stderr_beta: None,
            alt_allele_freq: None,
            extra: IndexMap::new(),
        })
    }

    /// Returns the chromosome, without any `chr` prefix.
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::{ParserConfig, Reader};
    ///
    /// let reader = Reader::from_path("resources/standard.tsv", ParserConfig::standard());
    /// let first = reader.iter().unwrap().next().unwrap().unwrap();
    /// assert_eq!(first.chrom(), "1");
    /// ```
    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    /// Returns the 1-based position.
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::{ParserConfig, Reader};
    ///
    /// let reader = Reader::from_path("resources/standard.tsv", ParserConfig::standard());
    /// let first = reader.iter().unwrap().next().unwrap().unwrap();
    /// assert_eq!(first.pos(), 762320);
    /// ```
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Returns the reference allele, or `None` if the input did not provide one.
    pub fn ref_allele(&self) -> Option<&str> {
        self.ref_allele.as_deref()
    }

    /// Returns the alternate allele, or `None` if the input did not provide one.
    pub fn alt_allele(&self) -> Option<&str> {
        self.alt_allele.as_deref()
    }

    /// Returns the p-value in linear space.
    ///
    /// Inputs given as `-log10(p)` are converted while parsing, so this is always a
    /// plain probability in `(0, 1]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::{ParserConfig, Reader};
    ///
    /// let reader = Reader::from_path("resources/standard.tsv", ParserConfig::standard());
    /// let first = reader.iter().unwrap().next().unwrap().unwrap();
    /// let p = first.pvalue().unwrap();
    /// assert!((p - 0.3775).abs() < 1e-4);
    /// ```
    pub fn pvalue(&self) -> Option<f64> {
        self.pvalue
    }

    /// `-log10(pvalue)`, derived on demand.
    pub fn neg_log_pvalue(&self) -> Option<f64> {
        self.pvalue.map(|p| -p.log10())
    }

    pub fn beta(&self) -> Option<f64> {
        self.beta
    }

    pub fn stderr_beta(&self) -> Option<f64> {
        self.stderr_beta
    }

    pub fn alt_allele_freq(&self) -> Option<f64> {
        self.alt_allele_freq
    }

    /// `chrom:pos_ref/alt`, or `chrom:pos` when either allele is unknown.
    pub fn marker(&self) -> String {
        match (&self.ref_allele, &self.alt_allele) {
            (Some(r), Some(a)) => format!("{}:{}_{}/{}", self.chrom, self.pos, r, a),
            _ => format!("{}:{}", self.chrom, self.pos),
        }
    }

    /// Fields added by the parser (extra columns) or by transforms and lookups.
    pub fn extra(&self) -> &IndexMap<String, Value> {
        &self.extra
    }

    pub fn set_pvalue(&mut self, pvalue: Option<f64>) -> Result<()> {
        if let Some(p) = pvalue {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::config(format!("pvalue {} is outside (0, 1]", p)));
            }
        }
        self.pvalue = pvalue;
        Ok(())
    }

    pub fn set_beta(&mut self, beta: Option<f64>) {
        self.beta = beta;
    }

    pub fn set_stderr_beta(&mut self, stderr_beta: Option<f64>) {
        self.stderr_beta = stderr_beta;
    }

    pub fn set_alt_allele_freq(&mut self, freq: Option<f64>) {
        self.alt_allele_freq = freq;
    }

    /// Look up any field by name. Unknown names read from the extra mapping and
    /// yield `Value::Missing` when absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use sumstats::{Record, Value};
    ///
    /// let record = Record::new("X", 2_700_000, Some("G"), Some("A")).unwrap();
    /// assert_eq!(record.get("chrom"), Value::from("X"));
    /// assert_eq!(record.get("pos"), Value::Int(2_700_000));
    /// assert_eq!(record.get("marker"), Value::from("X:2700000_G/A"));
    /// assert!(record.get("rsid").is_missing());
    /// ```
    pub fn get(&self, name: &str) -> Value {
        match KnownField::from_str(name) {
            Ok(KnownField::Chrom) => Value::Text(self.chrom.clone()),
            Ok(KnownField::Pos) => Value::from(self.pos),
            Ok(KnownField::Ref) => Value::from(self.ref_allele.clone()),
            Ok(KnownField::Alt) => Value::from(self.alt_allele.clone()),
            Ok(KnownField::Pvalue) => Value::from(self.pvalue),
            Ok(KnownField::NegLogPvalue) => Value::from(self.neg_log_pvalue()),
            Ok(KnownField::Beta) => Value::from(self.beta),
            Ok(KnownField::StderrBeta) => Value::from(self.stderr_beta),
            Ok(KnownField::AltAlleleFreq) => Value::from(self.alt_allele_freq),
            Ok(KnownField::Marker) => Value::Text(self.marker()),
            Err(_) => self.extra.get(name).cloned().unwrap_or(Value::Missing),
        }
    }

    /// Assign a field by name. Statistical fields are updated in place, other names
    /// land in the extra mapping (last write wins). Identity fields are read-only.
    pub fn set<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        let value = value.into();
        let field = match KnownField::from_str(name) {
            Ok(field) => field,
            Err(_) => {
                self.extra.insert(name.to_owned(), value);
                return Ok(());
            }
        };
        if field.is_identity() {
            return Err(Error::config(format!(
                "`{}` is an identity field and cannot be reassigned",
                name
            )));
        }
        let number = match &value {
            Value::Missing => None,
            v => Some(v.as_f64().ok_or_else(|| {
                Error::config(format!("field `{}` expects a number, got `{}`", name, v))
            })?),
        };
        match field {
            KnownField::Pvalue => self.set_pvalue(number)?,
            KnownField::NegLogPvalue => self.set_pvalue(number.map(|v| 10f64.powf(-v)))?,
            KnownField::Beta => self.beta = number,
            KnownField::StderrBeta => self.stderr_beta = number,
            KnownField::AltAlleleFreq => self.alt_allele_freq = number,
            KnownField::Chrom
            | KnownField::Pos
            | KnownField::Ref
            | KnownField::Alt
            | KnownField::Marker => {}
        }
        Ok(())
    }

    pub(crate) fn insert_extra(&mut self, name: &str, value: Value) {
        self.extra.insert(name.to_owned(), value);
    }
}

/// Uppercase an allele; a lone `.` or `-` means "unknown".
pub(crate) fn normalize_allele(raw: &str) -> Option<String> {
    let raw = raw.trim();
    match raw {
        "" | "." | "-" => None,
        allele => Some(allele.to_ascii_uppercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::new("1", 100, Some("a"), Some("c")).unwrap()
    }

    #[test]
    fn known_field_names_match_strum_serialization() {
        for name in KnownField::names() {
            assert!(KnownField::from_str(name).is_ok(), "{}", name);
        }
        let name: &'static str = KnownField::StderrBeta.into();
        assert_eq!(name, "stderr_beta");
    }

    #[test]
    fn identity_fields_are_read_only() {
        let mut record = record();
        assert!(matches!(record.set("chrom", "2"), Err(Error::Configuration(_))));
        assert!(record.set("marker", "x").is_err());
        assert_eq!(record.chrom(), "1");
    }

    #[test]
    fn statistical_fields_are_set_by_name() {
        let mut record = record();
        record.set("beta", 0.5).unwrap();
        record.set("neg_log_pvalue", 2.0).unwrap();
        assert_eq!(record.beta(), Some(0.5));
        assert!((record.pvalue().unwrap() - 0.01).abs() < 1e-12);
        assert!(record.set("pvalue", 1.5).is_err());
        assert!(record.set("beta", "big").is_err());
        record.set("beta", Value::Missing).unwrap();
        assert_eq!(record.beta(), None);
    }

    #[test]
    fn extra_fields_are_last_write_wins() {
        let mut record = record();
        record.set("rsid", "rs1").unwrap();
        record.set("rsid", "rs2").unwrap();
        assert_eq!(record.get("rsid"), Value::from("rs2"));
        assert_eq!(record.extra().len(), 1);
    }

    #[test]
    fn missing_is_distinct_from_zero() {
        let mut record = record();
        assert!(record.get("beta").is_missing());
        record.set_beta(Some(0.0));
        assert_eq!(record.get("beta"), Value::Float(0.0));
    }

    #[test]
    fn marker_omits_unknown_alleles() {
        let record = Record::new("7", 5, Some("A"), None).unwrap();
        assert_eq!(record.marker(), "7:5");
    }
}
