//! Benchmark execution strategies.
//!
//! Each strategy implements the same contract: `validate` must pass before
//! `execute_benchmark`, and execution wraps its external invocations in a
//! scoped environment. The runner instantiates one strategy per benchmark
//! point and dispatches on the job control's mode.

mod binary;
mod fully_dockerized;
mod scavenging;

pub use binary::BinaryBenchmark;
pub use fully_dockerized::FullyDockerizedBenchmark;
pub use scavenging::ScavengingBenchmark;

use crate::constants::BENCHMARK_COMMAND_ARGS;
use crate::error::{Error, Result};
use crate::job_control::{JobControl, Mode, SourceIdentity};

/// The benchmark execution contract.
pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Check that the job control carries everything this strategy needs.
    fn validate(&self) -> Result<()>;

    /// Run the benchmark for the configured point.
    fn execute_benchmark(&mut self) -> Result<()>;
}

/// Instantiate the strategy selected by the job control's mode.
pub fn create(control: &JobControl) -> Result<Box<dyn Strategy>> {
    match control.mode {
        Some(Mode::FullyDockerized) => Ok(Box::new(FullyDockerizedBenchmark::new(control))),
        Some(Mode::Scavenging) => Ok(Box::new(ScavengingBenchmark::new(control))),
        Some(Mode::Binary) => Ok(Box::new(BinaryBenchmark::new(control))),
        None => Err(Error::Config("no benchmark mode selected".to_string())),
    }
}

/// Remote execution is accepted by the model but has no implementation.
fn ensure_local(control: &JobControl) -> Result<()> {
    if control.remote {
        return Err(Error::NotImplemented("remote benchmark execution"));
    }
    Ok(())
}

/// Every image missing from the image set must be buildable from an
/// appropriately identified source.
fn verify_images_or_sources(control: &JobControl) -> Result<()> {
    let images = control.images.clone().unwrap_or_default();
    let source_usable = |identity| {
        control
            .source(identity)
            .map(|s| s.is_usable())
            .unwrap_or(false)
    };

    if images.proxy_image.is_empty() && !source_usable(SourceIdentity::ProxyUnderTest) {
        return Err(Error::Config(
            "no source specified to build the undefined proxy image".to_string(),
        ));
    }
    if !images.have_loadgen_images() && !source_usable(SourceIdentity::LoadGenerator) {
        return Err(Error::Config(
            "no source specified to build the undefined load generator images".to_string(),
        ));
    }
    Ok(())
}

/// Command line the benchmark driver runs with, in and out of containers.
fn benchmark_command() -> Vec<String> {
    let mut command = vec!["./benchmarks".to_string()];
    command.extend(
        BENCHMARK_COMMAND_ARGS
            .split_whitespace()
            .map(str::to_string),
    );
    command
}
