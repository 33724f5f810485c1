//! Transformers serialize extracted records into output bytes.
//!
//! A transformer owns its framing: `jsonl` emits exactly one
//! newline-terminated JSON object per record, `csv` one CSV row (with a
//! header row of field names), `cbor` one CBOR item, and `passthrough`
//! the record's `raw` field verbatim.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::extract::Record;

pub trait Transformer: Send + Sync {
    /// Bytes written once when a chunk opens; may be empty.
    fn header(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn transform(&self, record: &Record) -> Result<Vec<u8>>;

    /// Bytes written once before a chunk closes; may be empty.
    fn footer(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

type Options = BTreeMap<String, Value>;
type Factory = Arc<dyn Fn(&Options) -> Result<Box<dyn Transformer>> + Send + Sync>;

/// Named transformer factories, populated once at startup. Each job
/// gets a fresh transformer built from its own options.
#[derive(Clone)]
pub struct TransformerRegistry {
    by_name: HashMap<String, Factory>,
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        fn jsonl(_: &Options) -> Result<Box<dyn Transformer>> {
            Ok(Box::new(JsonlTransformer))
        }
        fn csv(opts: &Options) -> Result<Box<dyn Transformer>> {
            Ok(Box::new(CsvTransformer::from_options(opts)?))
        }
        fn cbor(_: &Options) -> Result<Box<dyn Transformer>> {
            Ok(Box::new(CborTransformer))
        }
        fn raw(_: &Options) -> Result<Box<dyn Transformer>> {
            Ok(Box::new(RawTransformer))
        }

        let mut reg = Self::empty();
        reg.register("jsonl", Arc::new(jsonl));
        reg.register("csv", Arc::new(csv));
        reg.register("cbor", Arc::new(cbor));
        reg.register("passthrough", Arc::new(raw));
        reg.register("dummy", Arc::new(raw));
        reg
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.by_name.insert(name.to_string(), factory);
    }

    pub fn build(&self, name: &str, options: &Options) -> Result<Box<dyn Transformer>> {
        let factory = self
            .by_name
            .get(name)
            .ok_or_else(|| Error::validation(format!("unknown transformer {name:?}")))?;
        factory(options)
    }
}

/// One JSON object per line.
pub struct JsonlTransformer;

impl Transformer for JsonlTransformer {
    fn transform(&self, record: &Record) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(&Value::Object(record.clone()))?;
        line.push(b'\n');
        Ok(line)
    }
}

/// CSV rows over a fixed field list; missing fields become empty cells.
pub struct CsvTransformer {
    fields: Vec<String>,
}

impl CsvTransformer {
    pub fn from_options(options: &Options) -> Result<Self> {
        let fields = options
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::validation("csv transformer requires a fields list"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::validation("csv fields must be strings"))
            })
            .collect::<Result<Vec<_>>>()?;
        if fields.is_empty() {
            return Err(Error::validation("csv transformer requires a fields list"));
        }
        Ok(Self { fields })
    }

    fn write_row<I, S>(&self, cells: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(cells)
            .map_err(|e| Error::fatal(format!("csv: {e}")))?;
        writer
            .into_inner()
            .map_err(|e| Error::fatal(format!("csv: {e}")))
    }
}

impl Transformer for CsvTransformer {
    fn header(&self) -> Result<Vec<u8>> {
        self.write_row(self.fields.iter().map(String::as_bytes))
    }

    fn transform(&self, record: &Record) -> Result<Vec<u8>> {
        let cells: Vec<String> = self
            .fields
            .iter()
            .map(|field| match record.get(field) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        self.write_row(cells.iter().map(String::as_bytes))
    }
}

/// One CBOR item per record.
pub struct CborTransformer;

impl Transformer for CborTransformer {
    fn transform(&self, record: &Record) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(&Value::Object(record.clone()), &mut out)
            .map_err(|e| Error::fatal(format!("cbor: {e}")))?;
        Ok(out)
    }
}

/// Emits the record's `raw` field as-is, no framing.
pub struct RawTransformer;

impl Transformer for RawTransformer {
    fn transform(&self, record: &Record) -> Result<Vec<u8>> {
        match record.get("raw") {
            Some(Value::String(s)) => Ok(s.clone().into_bytes()),
            _ => Err(Error::validation("record has no raw field to pass through")),
        }
    }
}
