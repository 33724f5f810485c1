//! Extractors turn raw CT log entries into free-form records.
//!
//! A record is a JSON object; transformers decide how it is
//! serialized. Extractors are looked up by name from the job spec.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Buf;
use serde_json::Value;

use crate::ctlog::LogEntry;
use crate::error::{Error, Result};

pub type Record = serde_json::Map<String, Value>;

pub trait Extractor: Send + Sync {
    fn extract(&self, entry: &LogEntry) -> Result<Record>;
}

/// Named extractor lookup, populated once at startup.
#[derive(Clone)]
pub struct ExtractorRegistry {
    by_name: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    /// Registry with all built-in extractors.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        reg.register("raw", Arc::new(RawExtractor));
        reg.register("leaf", Arc::new(LeafExtractor));
        reg
    }

    pub fn register(&mut self, name: &str, extractor: Arc<dyn Extractor>) {
        self.by_name.insert(name.to_string(), extractor);
    }

    pub fn for_name(&self, name: &str) -> Result<Arc<dyn Extractor>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown extractor {name:?}")))
    }
}

/// Passes the entry through untouched: index plus the base64 payloads
/// exactly as the log returned them.
pub struct RawExtractor;

impl Extractor for RawExtractor {
    fn extract(&self, entry: &LogEntry) -> Result<Record> {
        let mut record = Record::new();
        record.insert("index".into(), entry.index.into());
        record.insert("leaf_input".into(), entry.leaf_input.clone().into());
        record.insert("extra_data".into(), entry.extra_data.clone().into());
        record.insert("raw".into(), entry.leaf_input.clone().into());
        Ok(record)
    }
}

/// Decodes the MerkleTreeLeaf header: timestamp, entry type, and the
/// embedded certificate. The certificate itself stays DER; nothing
/// here validates X.509 structure.
pub struct LeafExtractor;

impl Extractor for LeafExtractor {
    fn extract(&self, entry: &LogEntry) -> Result<Record> {
        let leaf = BASE64
            .decode(&entry.leaf_input)
            .map_err(|e| Error::corrupt(format!("leaf {}: {e}", entry.index)))?;
        let mut buf = leaf.as_slice();
        if buf.remaining() < 12 {
            return Err(Error::corrupt(format!(
                "leaf {}: truncated MerkleTreeLeaf header",
                entry.index
            )));
        }
        let version = buf.get_u8();
        let leaf_type = buf.get_u8();
        let timestamp = buf.get_u64();
        let entry_type = buf.get_u16();

        let mut record = Record::new();
        record.insert("index".into(), entry.index.into());
        record.insert("version".into(), version.into());
        record.insert("leaf_type".into(), leaf_type.into());
        record.insert("timestamp".into(), timestamp.into());

        match entry_type {
            0 => {
                record.insert("entry_type".into(), "x509".into());
                let der = read_tls_vec24(&mut buf, entry.index)?;
                record.insert("cert_der".into(), BASE64.encode(der).into());
            }
            1 => {
                record.insert("entry_type".into(), "precert".into());
                if buf.remaining() < 32 {
                    return Err(Error::corrupt(format!(
                        "leaf {}: truncated issuer key hash",
                        entry.index
                    )));
                }
                let mut hash = [0u8; 32];
                buf.copy_to_slice(&mut hash);
                record.insert("issuer_key_hash".into(), hex::encode(hash).into());
                let tbs = read_tls_vec24(&mut buf, entry.index)?;
                record.insert("tbs_der".into(), BASE64.encode(tbs).into());
            }
            other => {
                return Err(Error::corrupt(format!(
                    "leaf {}: unknown entry type {other}",
                    entry.index
                )));
            }
        }
        Ok(record)
    }
}

/// A TLS opaque vector with a 24-bit length prefix.
fn read_tls_vec24(buf: &mut &[u8], index: u64) -> Result<Vec<u8>> {
    if buf.remaining() < 3 {
        return Err(Error::corrupt(format!("leaf {index}: truncated length")));
    }
    let len = ((buf.get_u8() as usize) << 16) | (buf.get_u16() as usize);
    if buf.remaining() < len {
        return Err(Error::corrupt(format!("leaf {index}: truncated body")));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_entry(entry_type: u16, body: &[u8]) -> LogEntry {
        let mut leaf = vec![0u8, 0u8];
        leaf.extend_from_slice(&1_690_000_000_000u64.to_be_bytes());
        leaf.extend_from_slice(&entry_type.to_be_bytes());
        leaf.extend_from_slice(&[
            (body.len() >> 16) as u8,
            (body.len() >> 8) as u8,
            body.len() as u8,
        ]);
        leaf.extend_from_slice(body);
        LogEntry {
            index: 7,
            leaf_input: BASE64.encode(leaf),
            extra_data: String::new(),
        }
    }

    #[test]
    fn raw_extractor_passes_payloads() {
        let entry = LogEntry {
            index: 3,
            leaf_input: "bGVhZg==".into(),
            extra_data: "eA==".into(),
        };
        let record = RawExtractor.extract(&entry).unwrap();
        assert_eq!(record["index"], 3);
        assert_eq!(record["raw"], "bGVhZg==");
    }

    #[test]
    fn leaf_extractor_parses_x509_entry() {
        let record = LeafExtractor.extract(&leaf_entry(0, b"DERDER")).unwrap();
        assert_eq!(record["entry_type"], "x509");
        assert_eq!(record["timestamp"], 1_690_000_000_000u64);
        assert_eq!(record["cert_der"], BASE64.encode(b"DERDER"));
    }

    #[test]
    fn leaf_extractor_rejects_truncated_leaf() {
        let entry = LogEntry {
            index: 1,
            leaf_input: BASE64.encode([0u8; 4]),
            extra_data: String::new(),
        };
        assert!(matches!(
            LeafExtractor.extract(&entry).unwrap_err(),
            Error::Corrupt(_)
        ));
    }

    #[test]
    fn registry_lookup() {
        let reg = ExtractorRegistry::builtin();
        assert!(reg.for_name("raw").is_ok());
        assert!(reg.for_name("leaf").is_ok());
        assert!(reg.for_name("nope").is_err());
    }
}
