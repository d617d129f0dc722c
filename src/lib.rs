//! THub: quota-governed market scanning and signal convergence.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod cache;
pub mod config;
pub mod data;
pub mod engine;
pub mod quota;
pub mod storage;
pub mod strategy;
pub mod types;
pub mod webhook;
