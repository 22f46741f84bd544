//! Benchmark where the driver, load generator and proxy all run in
//! containers.

use tracing::{debug, info};

use crate::constants::BENCHMARK_SUCCESS_MARKER;
use crate::docker::{benchmark_volumes, DockerClient, RunParameters};
use crate::env_scope::EnvScope;
use crate::error::{Error, Result};
use crate::job_control::JobControl;

use super::{benchmark_command, ensure_local, verify_images_or_sources, Strategy};

pub struct FullyDockerizedBenchmark {
    control: JobControl,
    client: DockerClient,
}

impl FullyDockerizedBenchmark {
    pub fn new(control: &JobControl) -> Self {
        Self {
            control: control.clone(),
            client: DockerClient::new(),
        }
    }
}

impl Strategy for FullyDockerizedBenchmark {
    fn name(&self) -> &'static str {
        "fully-dockerized"
    }

    fn validate(&self) -> Result<()> {
        verify_images_or_sources(&self.control)
    }

    fn execute_benchmark(&mut self) -> Result<()> {
        ensure_local(&self.control)?;

        let images = self.control.images.clone().unwrap_or_default();
        let environment = &self.control.environment;
        let output_dir = environment.output_dir.display().to_string();

        // TMPDIR is required for the driver to place its artifacts.
        let image_vars = vec![
            ("PROXY_IMAGE_TO_TEST".to_string(), images.proxy_image.clone()),
            ("LOADGEN_IMAGE".to_string(), images.loadgen_binary_image.clone()),
            ("TMPDIR".to_string(), output_dir.clone()),
        ];
        debug!(?image_vars, "container environment");

        let params = RunParameters {
            environment: image_vars,
            command: benchmark_command(),
            volumes: benchmark_volumes(environment),
            host_network: true,
            tty: true,
        };

        let scope = EnvScope::enter(environment)?;
        let result = self.client.run_image(&images.loadgen_benchmark_image, &params);
        drop(scope);

        let output = result?;
        debug!(bytes = output.len(), "benchmark container output");
        if !output.contains(BENCHMARK_SUCCESS_MARKER) {
            return Err(Error::Benchmark(format!(
                "benchmark output did not contain `{BENCHMARK_SUCCESS_MARKER}`"
            )));
        }
        info!(%output_dir, "benchmark artifacts written");
        Ok(())
    }
}
