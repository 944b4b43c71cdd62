//! conveyor-core
//!
//! Task dispatch and pipeline continuation for a staged ingest pipeline.
//!
//! # Modules
//! - **domain**: task envelope, context, stages, entity references, errors
//! - **ports**: broker, ledger, entity store and collaborator traits
//! - **app**: publisher, router, stage handlers, continuation, workers, builder
//! - **impls**: in-memory broker, ledger, entity store and reference collaborators
//! - **config**: TOML configuration with environment overrides

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
