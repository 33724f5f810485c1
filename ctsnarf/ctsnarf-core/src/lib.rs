//! Core engine of the ctsnarf CT log ingestion cluster: coordination
//! over a shared KV store, the shard lease protocol, the per-shard ETL
//! pipeline, and the building blocks (sinks, extractors, transformers,
//! compression, secrets) that jobs are assembled from.

pub mod cluster;
pub mod compress;
pub mod ctlog;
pub mod error;
pub mod extract;
pub mod kv;
pub mod pipeline;
pub mod secrets;
pub mod sink;
pub mod transform;
pub mod worker;

pub use error::{Error, Result};
