use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::parser::normalize_chrom;
use crate::record::normalize_allele;
use crate::types::{ChromCase, Value, MISSING_VALUES};

/// A read-only map from variant identity to an auxiliary value (e.g. an rsID).
///
/// `Ok(None)` means "not found" and is attached to the record as
/// [`Value::Missing`]; `Err` is a failure of the lookup itself and aborts the pass.
pub trait Lookup {
    fn query(
        &self,
        chrom: &str,
        pos: u32,
        ref_allele: Option<&str>,
        alt_allele: Option<&str>,
    ) -> anyhow::Result<Option<Value>>;
}

impl<F> Lookup for F
where
    F: Fn(&str, u32, Option<&str>, Option<&str>) -> anyhow::Result<Option<Value>>,
{
    fn query(
        &self,
        chrom: &str,
        pos: u32,
        ref_allele: Option<&str>,
        alt_allele: Option<&str>,
    ) -> anyhow::Result<Option<Value>> {
        self(chrom, pos, ref_allele, alt_allele)
    }
}

/// Normalized variant identity, as used for lookup keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub chrom: String,
    pub pos: u32,
    pub ref_allele: Option<String>,
    pub alt_allele: Option<String>,
}

impl VariantKey {
    pub fn new(chrom: &str, pos: u32, ref_allele: Option<&str>, alt_allele: Option<&str>) -> Self {
        Self {
            chrom: chrom.to_owned(),
            pos,
            ref_allele: ref_allele.and_then(normalize_allele),
            alt_allele: alt_allele.and_then(normalize_allele),
        }
    }
}

impl Lookup for HashMap<VariantKey, Value> {
    fn query(
        &self,
        chrom: &str,
        pos: u32,
        ref_allele: Option<&str>,
        alt_allele: Option<&str>,
    ) -> anyhow::Result<Option<Value>> {
        Ok(self
            .get(&VariantKey::new(chrom, pos, ref_allele, alt_allele))
            .cloned())
    }
}

/// An in-memory lookup loaded from a tab-delimited `chrom pos ref alt value` table
/// (plain or gzip). Lines starting with `#` are ignored.
#[derive(Debug, Clone, Default)]
pub struct TableLookup {
    entries: HashMap<VariantKey, Value>,
}

impl TableLookup {
    /// # Examples
    ///
    /// ```
    /// use sumstats::{Lookup, TableLookup, Value};
    ///
    /// let rsids = TableLookup::from_path("resources/rsid_lookup.tsv").unwrap();
    /// let hit = rsids.query("1", 762320, Some("C"), Some("T")).unwrap();
    /// assert_eq!(hit, Some(Value::from("rs75333668")));
    /// assert_eq!(rsids.query("1", 1, Some("C"), Some("T")).unwrap(), None);
    /// ```
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (reader, compression) = niffler::from_path(path)?;
        let reader = std::io::BufReader::new(reader);
        let mut entries = HashMap::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 5 {
                return Err(Error::line_parse(
                    format!(
                        "lookup table line {} has {} fields, expected 5",
                        idx + 1,
                        fields.len()
                    ),
                    &line,
                ));
            }
            let chrom = normalize_chrom(fields[0], ChromCase::Preserve, &MISSING_VALUES)
                .map_err(|message| Error::line_parse(message, &line))?;
            let pos = fields[1]
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::line_parse("lookup position is not an integer", &line))?;
            let key = VariantKey::new(&chrom, pos, Some(fields[2]), Some(fields[3]));
            entries.insert(key, Value::from_field(fields[4], &MISSING_VALUES));
        }
        info!(path = %path.display(), ?compression, entries = entries.len(), "loaded lookup table");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Lookup for TableLookup {
    fn query(
        &self,
        chrom: &str,
        pos: u32,
        ref_allele: Option<&str>,
        alt_allele: Option<&str>,
    ) -> anyhow::Result<Option<Value>> {
        self.entries.query(chrom, pos, ref_allele, alt_allele)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_lookups() {
        let lookup = |chrom: &str,
                      pos: u32,
                      _: Option<&str>,
                      _: Option<&str>|
         -> anyhow::Result<Option<Value>> {
            Ok(if chrom == "1" { Some(Value::from(pos)) } else { None })
        };
        assert_eq!(lookup.query("1", 5, None, None).unwrap(), Some(Value::Int(5)));
        assert_eq!(lookup.query("2", 5, None, None).unwrap(), None);
    }

    #[test]
    fn map_keys_are_normalized() {
        let mut map = HashMap::new();
        map.insert(VariantKey::new("1", 10, Some("a"), Some("g")), Value::from("rs1"));
        assert_eq!(
            map.query("1", 10, Some("A"), Some("G")).unwrap(),
            Some(Value::from("rs1"))
        );
        assert_eq!(map.query("1", 10, Some("A"), Some("T")).unwrap(), None);
    }

    #[test]
    fn table_rejects_short_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        std::fs::write(&path, "1\t10\tA\n").unwrap();
        assert!(matches!(
            TableLookup::from_path(&path),
            Err(Error::LineParse { .. })
        ));
    }
}
