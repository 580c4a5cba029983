//! TIERFLOW: tiered settlement queue, portfolio reconciler and order engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod collaborators;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod market;
pub mod storage;
pub mod types;
