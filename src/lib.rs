//! NetFlow v9 collector.
//!
//! The [`Decoder`] turns NetFlow v9 packets into normalized [`FlowMessage`]s,
//! keeping the templates and sampling rates announced by each exporter.

pub mod collector;
pub mod config;
pub mod metrics;
pub mod netflow;

pub use metrics::DecoderMetrics;
pub use netflow::decoder::{DecodeError, Decoder};
pub use netflow::record::FlowMessage;
pub use netflow::template::TemplateCache;
