//! Core of the salvo benchmark orchestrator.
//!
//! Salvo benchmarks a proxy server across versions: it resolves the set of
//! benchmark points (tags or commit hashes) from a job control document,
//! obtains a proxy artifact for each point by pulling an image or building
//! from source, and drives a load-generator benchmark against every point,
//! collecting artifacts under one output directory per point.

pub mod benchmark;
pub mod builder;
pub mod cmd_exec;
pub mod constants;
pub mod docker;
pub mod env_scope;
pub mod error;
pub mod job_control;
pub mod runner;
pub mod source_manager;
pub mod source_tree;

pub use error::{Error, Result};
pub use job_control::{load_control_doc, JobControl};
pub use runner::{execute, RunSummary};
