//! Benchmark where the driver runs natively from the load-generator's build
//! output and launches the proxy and load generator from container images.

use tracing::{debug, info};

use crate::builder::LoadGeneratorBuilder;
use crate::constants::BENCHMARK_COMMAND_ARGS;
use crate::env_scope::EnvScope;
use crate::error::Result;
use crate::job_control::JobControl;
use crate::source_manager::SourceManager;

use super::{ensure_local, verify_images_or_sources, Strategy};

pub struct ScavengingBenchmark {
    control: JobControl,
    manager: SourceManager,
}

impl ScavengingBenchmark {
    pub fn new(control: &JobControl) -> Self {
        Self {
            control: control.clone(),
            manager: SourceManager::new(control),
        }
    }
}

impl Strategy for ScavengingBenchmark {
    fn name(&self) -> &'static str {
        "scavenging"
    }

    fn validate(&self) -> Result<()> {
        verify_images_or_sources(&self.control)
    }

    fn execute_benchmark(&mut self) -> Result<()> {
        ensure_local(&self.control)?;

        let mut builder = LoadGeneratorBuilder::new(&mut self.manager)?;
        builder.prepare_source()?;
        let driver = builder.build_benchmark_target()?;
        debug!(driver = %driver.display(), "benchmark driver built");

        // The driver consumes the image names and TMPDIR from its
        // environment; explicit user variables win.
        let images = self.control.images.clone().unwrap_or_default();
        let mut environment = self.control.environment.clone();
        let mut default_var = |key: &str, value: String| {
            if !value.is_empty() && !environment.variables.contains_key(key) {
                environment.variables.insert(key.to_string(), value);
            }
        };
        default_var("PROXY_IMAGE_TO_TEST", images.proxy_image.clone());
        default_var("LOADGEN_IMAGE", images.loadgen_binary_image.clone());
        default_var(
            "TMPDIR",
            self.control.environment.output_dir.display().to_string(),
        );

        let scope = EnvScope::enter(&environment)?;
        let result = builder.run_benchmark_driver(BENCHMARK_COMMAND_ARGS);
        drop(scope);

        let output = result?;
        debug!(bytes = output.len(), "benchmark driver output");
        info!(output_dir = %self.control.environment.output_dir.display(), "benchmark complete");
        Ok(())
    }
}
