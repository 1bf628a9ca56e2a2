pub mod bgzf;
pub mod error;
pub mod index;
pub mod indexed;
pub mod lookup;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod sniffer;
pub mod types;
pub mod writer;

pub use error::{Error, Result};
pub use indexed::{Fetch, IndexedReader};
pub use lookup::{Lookup, TableLookup, VariantKey};
pub use parser::{Parser, ParserConfig, ParserConfigBuilder};
pub use pipeline::{Pipeline, Stage};
pub use reader::{ErrorRecord, ParserSource, Reader, ReaderState, Records};
pub use record::{KnownField, Record, DEFAULT_COLUMNS};
pub use sniffer::{ColumnMapping, Sniffer};
pub use types::{ChromCase, Delimiter, PvalueScale, Value};
pub use writer::Writer;
