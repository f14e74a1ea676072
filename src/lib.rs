//! thermal-streamer: an edge agent that samples I2C environmental sensors
//! and appends the resulting rows to a cloud ingestion service.
//!
//! See `SPEC_FULL.md` for the full module breakdown. The runtime pipeline
//! is, roughly: [`sensor::cache::SensorCache`] decouples slow probe I/O
//! from row emission; [`reading::ReadingAssembler`] merges the cache with
//! [`metrics::SystemMetrics`] and [`identity::HostIdentity`] into a
//! [`reading::Reading`]; [`scheduler::BatchScheduler`] batches readings and
//! hands them to [`ingest::client::IngestClient`], which owns the
//! streaming channel's offset-token discipline.

pub mod config;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod metrics;
pub mod reading;
pub mod scheduler;
pub mod sensor;
pub mod supervisor;
pub mod token;
