//! `runcore` is the local background service that sits between a run's
//! client SDK and the tracking backend: it ingests the client's record
//! stream over a length-prefixed wire protocol, applies each record to
//! in-memory run state, persists it to an append-only transaction log, and
//! forwards it to a GraphQL+HTTP backend, including resumable runs and
//! uploading run output files.
//!
//! # Architecture
//!
//! A connection's inbound records flow through three stages, in order:
//!
//! 1. [`handler`] applies every record to `RunState`/`ConfigMap`/
//!    `SummaryMap`/`MetricDefinitions` and fans the same ordered stream out
//!    to the next two stages.
//! 2. [`writer`] appends each record to the [`txlog`] transaction log.
//! 3. [`sender`] forwards records to the backend over [`transport`],
//!    manages file uploads via [`saved_file`], [`batcher`] and [`watcher`],
//!    and streams console/history/summary data via [`filestream`].
//!
//! [`wire`] carries records between a client and the service; [`service`]
//! binds the listener and assembles one pipeline per stream; [`config`]
//! loads the service's own configuration; [`error`] is the crate-wide
//! error type.

pub mod batcher;
pub mod config;
pub mod error;
pub mod filestream;
pub mod handler;
pub mod record;
pub mod saved_file;
pub mod sender;
pub mod service;
pub mod sync_service;
pub mod transport;
pub mod txlog;
pub mod watcher;
pub mod wire;
pub mod writer;

pub use config::ServiceConfig;
pub use error::{ErrorContext, RuncoreError, RuncoreResult};
