use std::fmt;

use crate::error::{Error, Result};
use crate::lookup::Lookup;
use crate::record::Record;
use crate::types::Value;

/// One registered pipeline step.
pub enum Stage {
    /// Keep records whose field equals the value; missing fields never match.
    FieldEquals { field: String, value: Value },
    /// Keep records whose field is present.
    FieldPresent { field: String },
    /// Keep records whose field is present and satisfies the predicate.
    FieldMatches {
        field: String,
        predicate: Box<dyn Fn(&Value) -> anyhow::Result<bool>>,
    },
    /// Keep records satisfying a predicate over the whole record.
    Predicate(Box<dyn Fn(&Record) -> anyhow::Result<bool>>),
    Transform(Box<dyn Fn(Record) -> anyhow::Result<Record>>),
    /// Attach the lookup result under `field`, [`Value::Missing`] when not found.
    Lookup { field: String, lookup: Box<dyn Lookup> },
}

impl Stage {
    pub fn describe(&self) -> String {
        match self {
            Stage::FieldEquals { field, value } => format!("filter `{}` == `{}`", field, value),
            Stage::FieldPresent { field } => format!("filter `{}` present", field),
            Stage::FieldMatches { field, .. } => format!("filter on `{}`", field),
            Stage::Predicate(_) => "record filter".to_owned(),
            Stage::Transform(_) => "transform".to_owned(),
            Stage::Lookup { field, .. } => format!("lookup `{}`", field),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Ordered stages; registration order is execution order.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run a record through every stage. `Ok(None)` means a filter excluded it.
    pub fn apply(&self, mut record: Record) -> Result<Option<Record>> {
        for (idx, stage) in self.stages.iter().enumerate() {
            let failed = |source: anyhow::Error| Error::PipelineStage {
                stage: format!("#{} ({})", idx + 1, stage.describe()),
                source,
            };
            let keep = match stage {
                Stage::FieldEquals { field, value } => {
                    let actual = record.get(field);
                    !actual.is_missing() && actual == *value
                }
                Stage::FieldPresent { field } => !record.get(field).is_missing(),
                Stage::FieldMatches { field, predicate } => {
                    let actual = record.get(field);
                    !actual.is_missing() && predicate(&actual).map_err(failed)?
                }
                Stage::Predicate(predicate) => predicate(&record).map_err(failed)?,
                Stage::Transform(transform) => {
                    record = transform(record).map_err(failed)?;
                    true
                }
                Stage::Lookup { field, lookup } => {
                    let found = lookup
                        .query(
                            record.chrom(),
                            record.pos(),
                            record.ref_allele(),
                            record.alt_allele(),
                        )
                        .map_err(failed)?;
                    record
                        .set(field, found.unwrap_or(Value::Missing))
                        .map_err(|e| failed(e.into()))?;
                    true
                }
            };
            if !keep {
                return Ok(None);
            }
        }
        Ok(Some(record))
    }
}
