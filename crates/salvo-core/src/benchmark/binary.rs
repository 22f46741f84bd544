//! Benchmark driving a native proxy binary, either supplied by the job
//! control or built from source.

use std::path::Path;

use tracing::{debug, info};

use crate::builder::{LoadGeneratorBuilder, ProxyBuilder};
use crate::env_scope::EnvScope;
use crate::error::{Error, Result};
use crate::job_control::{JobControl, SourceIdentity};
use crate::source_manager::SourceManager;

use super::{ensure_local, Strategy};

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub struct BinaryBenchmark {
    control: JobControl,
    manager: SourceManager,
}

impl BinaryBenchmark {
    pub fn new(control: &JobControl) -> Self {
        Self {
            control: control.clone(),
            manager: SourceManager::new(control),
        }
    }

    fn source_usable(&self, identity: SourceIdentity) -> bool {
        self.control
            .source(identity)
            .map(|s| s.is_usable())
            .unwrap_or(false)
    }
}

impl Strategy for BinaryBenchmark {
    fn name(&self) -> &'static str {
        "binary"
    }

    /// The load generator must be buildable from source; its image is not
    /// sufficient here. The proxy is satisfied by an executable
    /// `proxy_path` or a buildable source.
    fn validate(&self) -> Result<()> {
        if !self.source_usable(SourceIdentity::LoadGenerator) {
            return Err(Error::Config(
                "no source specified to build the load generator".to_string(),
            ));
        }

        let proxy_path_ok = self
            .control
            .environment
            .proxy_path
            .as_deref()
            .map(is_executable_file)
            .unwrap_or(false);
        if !proxy_path_ok && !self.source_usable(SourceIdentity::ProxyUnderTest) {
            return Err(Error::Config(
                "No Proxy source or binary was specified".to_string(),
            ));
        }
        Ok(())
    }

    fn execute_benchmark(&mut self) -> Result<()> {
        ensure_local(&self.control)?;

        let proxy_path = match &self.control.environment.proxy_path {
            Some(path) => {
                info!(path = %path.display(), "using supplied proxy binary");
                path.clone()
            }
            None => {
                let mut builder = ProxyBuilder::new(&mut self.manager)?;
                builder.build_proxy_binary_from_source()?
            }
        };
        debug!(proxy = %proxy_path.display(), "proxy binary for benchmark");

        let mut builder = LoadGeneratorBuilder::new(&mut self.manager)?;
        builder.build_binary_targets()?;
        builder.build_benchmark_target()?;

        // TMPDIR is required for the driver to place its artifacts; an
        // explicit user variable wins.
        let mut environment = self.control.environment.clone();
        environment.proxy_path = Some(proxy_path);
        if !environment.variables.contains_key("TMPDIR") {
            environment.variables.insert(
                "TMPDIR".to_string(),
                self.control.environment.output_dir.display().to_string(),
            );
        }

        let scope = EnvScope::enter(&environment)?;
        let result = builder.run_benchmark_tests();
        drop(scope);

        let output = result?;
        debug!(bytes = output.len(), "test runner output");
        info!(output_dir = %self.control.environment.output_dir.display(), "benchmark complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::{Environment, Mode, SourceRepository};

    fn loadgen_source() -> SourceRepository {
        SourceRepository {
            identity: Some(SourceIdentity::LoadGenerator),
            source_url: Some("https://example.com/loadgen.git".to_string()),
            ..SourceRepository::default()
        }
    }

    fn binary_control() -> JobControl {
        JobControl {
            mode: Some(Mode::Binary),
            sources: vec![loadgen_source()],
            environment: Environment::default(),
            ..JobControl::default()
        }
    }

    fn executable_file(dir: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("proxy");
        std::fs::write(&path, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[test]
    fn rejects_missing_proxy_source_and_binary() {
        let strategy = BinaryBenchmark::new(&binary_control());
        let err = strategy.validate().expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "invalid job control: No Proxy source or binary was specified"
        );
    }

    #[test]
    fn rejects_missing_loadgen_source() {
        let mut control = binary_control();
        control.sources.clear();
        let strategy = BinaryBenchmark::new(&control);
        let err = strategy.validate().expect_err("must fail");
        assert!(err.to_string().contains("load generator"));
    }

    #[test]
    fn executable_proxy_path_satisfies_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut control = binary_control();
        control.environment.proxy_path = Some(executable_file(dir.path()));
        BinaryBenchmark::new(&control).validate().expect("valid");
    }

    #[test]
    fn non_executable_proxy_path_is_not_sufficient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proxy");
        std::fs::write(&path, "not a binary").expect("write");
        let mut control = binary_control();
        control.environment.proxy_path = Some(path);
        assert!(BinaryBenchmark::new(&control).validate().is_err());
    }

    #[test]
    fn proxy_source_satisfies_validation_without_binary() {
        let mut control = binary_control();
        control.sources.push(SourceRepository {
            identity: Some(SourceIdentity::ProxyUnderTest),
            source_path: Some("/src/proxy".into()),
            ..SourceRepository::default()
        });
        BinaryBenchmark::new(&control).validate().expect("valid");
    }
}
