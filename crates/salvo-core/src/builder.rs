//! Build proxy and load-generator artifacts from source.
//!
//! Builds run with an isolated `HOME` so the build tool's cache lives in a
//! per-build temporary directory, and with `CC`/`CXX` pointed at a discovered
//! clang when the host has not set them. Both overrides are passed to the
//! child process only; the process-wide environment is never touched here.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::cmd_exec;
use crate::constants::{
    LOADGEN_BENCHMARK_BINARY, LOADGEN_BENCHMARK_IMAGE_SCRIPT, LOADGEN_BENCHMARK_TARGET,
    LOADGEN_BINARY_IMAGE_SCRIPT, LOADGEN_BINARY_TARGETS, LOADGEN_TEST_TARGETS, PROXY_BINARY_PATH,
    PROXY_BUILD_TARGET, PROXY_DOCKERFILE, PROXY_STAGING_DIR, TOOLCHAIN_PROBE_PATHS,
};
use crate::docker::{proxy_image_name, DockerClient};
use crate::error::{Error, Result};
use crate::job_control::{SourceIdentity, SourceRepository};
use crate::source_manager::SourceManager;
use crate::source_tree;

/// First directory in `paths` holding a `clang` binary.
fn find_clang_in(paths: &[PathBuf]) -> Option<PathBuf> {
    paths.iter().find(|p| p.join("clang").exists()).cloned()
}

fn probe_clang() -> Option<PathBuf> {
    let paths: Vec<PathBuf> = TOOLCHAIN_PROBE_PATHS.iter().map(PathBuf::from).collect();
    find_clang_in(&paths)
}

/// Deduplicate the configured build options and default to an optimized
/// build when no build-mode flag was supplied.
pub fn compose_build_options(options: &[String]) -> String {
    let mut composed: Vec<String> = Vec::new();
    let mut optimized = true;
    for option in options {
        if !composed.contains(option) {
            composed.push(option.clone());
        }
        if option.starts_with("-c") {
            optimized = false;
        }
    }
    if optimized {
        composed.push("-c opt".to_string());
    }
    composed.join(" ")
}

/// Per-build working state: the cache directory serving as `HOME` and the
/// toolchain bindings passed to every build-tool child.
pub struct BuildContext {
    cache_dir: TempDir,
    toolchain: Vec<(String, String)>,
}

impl BuildContext {
    pub fn new() -> Result<Self> {
        let cache_dir = source_tree::fresh_temp_dir("salvo-build-")?;
        let mut toolchain = Vec::new();
        if std::env::var_os("CC").is_none() || std::env::var_os("CXX").is_none() {
            if let Some(dir) = probe_clang() {
                debug!(dir = %dir.display(), "using discovered clang toolchain");
                toolchain.push(("CC".to_string(), dir.join("clang").display().to_string()));
                toolchain.push(("CXX".to_string(), dir.join("clang++").display().to_string()));
            }
        }
        debug!(home = %cache_dir.path().display(), "build cache directory");
        Ok(Self {
            cache_dir,
            toolchain,
        })
    }

    fn child_env(&self) -> Vec<(&str, &str)> {
        let mut env = vec![("HOME", self.cache_dir.path().to_str().unwrap_or("/tmp"))];
        env.extend(
            self.toolchain
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        env
    }

    /// Run a build-tool command inside the working tree.
    pub fn run_build_tool(&self, cmd: &str, build_dir: &Path) -> Result<String> {
        cmd_exec::run_with_env(cmd, build_dir, &self.child_env())
    }

    /// Remove all build artifacts from the working tree.
    pub fn clean(&self, build_dir: &Path) -> Result<()> {
        let output = self.run_build_tool("bazel clean", build_dir)?;
        debug!(%output, "clean output");
        Ok(())
    }
}

fn ensure_identity(repo: &SourceRepository, wanted: SourceIdentity) -> Result<()> {
    if repo.identity != Some(wanted) {
        return Err(Error::Build(format!(
            "this builder supports {} sources only",
            wanted.as_str()
        )));
    }
    Ok(())
}

/// Builds the proxy binary and its container image from source.
pub struct ProxyBuilder<'a> {
    manager: &'a mut SourceManager,
    context: BuildContext,
    build_dir: Option<PathBuf>,
}

impl<'a> ProxyBuilder<'a> {
    pub fn new(manager: &'a mut SourceManager) -> Result<Self> {
        let repo = manager.get_source_repository(SourceIdentity::ProxyUnderTest)?;
        ensure_identity(&repo, SourceIdentity::ProxyUnderTest)?;
        Ok(Self {
            manager,
            context: BuildContext::new()?,
            build_dir: None,
        })
    }

    /// Materialize the source, check out the configured hash and build the
    /// static proxy binary. Returns the path of the built binary.
    pub fn build_proxy_binary_from_source(&mut self) -> Result<PathBuf> {
        let repo = self
            .manager
            .get_source_repository(SourceIdentity::ProxyUnderTest)?;
        let options = compose_build_options(&repo.build_options);

        let tree = self.manager.get_source_tree(SourceIdentity::ProxyUnderTest)?;
        let build_dir = if repo.source_path.is_some() {
            tree.copy_source_directory()?
        } else {
            tree.pull()?;
            tree.source_directory()?
        };
        tree.checkout_commit_hash()?;

        self.context.clean(&build_dir)?;
        info!(dir = %build_dir.display(), %options, "building proxy binary");
        self.context.run_build_tool(
            &format!("bazel build {options} {PROXY_BUILD_TARGET}"),
            &build_dir,
        )?;

        self.build_dir = Some(build_dir.clone());
        Ok(build_dir.join(PROXY_BINARY_PATH))
    }

    /// Build the proxy binary for `point`, stage it and produce the tagged
    /// container image. Returns the image name.
    pub fn build_proxy_image_from_source(&mut self, point: &str) -> Result<String> {
        self.manager
            .get_source_tree(SourceIdentity::ProxyUnderTest)?
            .set_commit_hash(point);
        let binary = self.build_proxy_binary_from_source()?;
        let build_dir = self
            .build_dir
            .clone()
            .ok_or_else(|| Error::Build("no build directory after proxy build".to_string()))?;

        self.stage_proxy(&build_dir, &binary, false)?;
        generate_docker_ignore(&build_dir)?;

        let image = proxy_image_name(point);
        DockerClient::new().build_image(&image, Path::new(PROXY_DOCKERFILE), &build_dir)?;
        Ok(image)
    }

    /// Copy the built binary into the staging directory, optionally
    /// stripping debug symbols. Callers pass `strip_binary=false` for now.
    fn stage_proxy(&self, build_dir: &Path, binary: &Path, strip_binary: bool) -> Result<PathBuf> {
        let staging = build_dir.join(PROXY_STAGING_DIR);
        fs::create_dir_all(&staging)?;
        let dest = staging.join(
            binary
                .file_name()
                .ok_or_else(|| Error::Build("proxy binary has no file name".to_string()))?,
        );
        if strip_binary {
            self.context.run_build_tool(
                &format!("objcopy --strip-debug {} {}", binary.display(), dest.display()),
                build_dir,
            )?;
        } else {
            fs::copy(binary, &dest)?;
        }
        Ok(dest)
    }
}

/// Exclude everything from the image build context except the staging
/// directory and the Dockerfile.
fn generate_docker_ignore(build_dir: &Path) -> Result<()> {
    let contents = format!("*\n!{PROXY_STAGING_DIR}/\n!{PROXY_DOCKERFILE}\n");
    fs::write(build_dir.join(".dockerignore"), contents)?;
    Ok(())
}

/// Builds the load-generator binaries, benchmark driver and images.
pub struct LoadGeneratorBuilder<'a> {
    manager: &'a mut SourceManager,
    context: BuildContext,
    build_dir: Option<PathBuf>,
}

impl<'a> LoadGeneratorBuilder<'a> {
    pub fn new(manager: &'a mut SourceManager) -> Result<Self> {
        let repo = manager.get_source_repository(SourceIdentity::LoadGenerator)?;
        ensure_identity(&repo, SourceIdentity::LoadGenerator)?;
        Ok(Self {
            manager,
            context: BuildContext::new()?,
            build_dir: None,
        })
    }

    /// Stage the load-generator source where we can build it: pull when a
    /// remote is configured, copy otherwise, then clean the tree.
    pub fn prepare_source(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.build_dir {
            return Ok(dir.clone());
        }
        let repo = self
            .manager
            .get_source_repository(SourceIdentity::LoadGenerator)?;
        let tree = self
            .manager
            .get_source_tree(SourceIdentity::LoadGenerator)?;
        let build_dir = if repo.source_path.is_some() {
            tree.copy_source_directory()?
        } else {
            tree.pull()?;
            tree.source_directory()?
        };
        tree.checkout_commit_hash()?;
        self.context.clean(&build_dir)?;
        self.build_dir = Some(build_dir.clone());
        Ok(build_dir)
    }

    fn build_options(&self) -> Result<String> {
        let repo = self
            .manager
            .get_source_repository(SourceIdentity::LoadGenerator)?;
        Ok(compose_build_options(&repo.build_options))
    }

    /// Build the benchmark driver target; required for the scavenging
    /// benchmark and a prerequisite of the benchmark image. Returns the path
    /// of the driver binary.
    pub fn build_benchmark_target(&mut self) -> Result<PathBuf> {
        let build_dir = self.prepare_source()?;
        let options = self.build_options()?;
        info!(dir = %build_dir.display(), "building load generator benchmark driver");
        self.context.run_build_tool(
            &format!("bazel build {options} {LOADGEN_BENCHMARK_TARGET}"),
            &build_dir,
        )?;
        Ok(build_dir.join(LOADGEN_BENCHMARK_BINARY))
    }

    /// Build the load-generator client and server binaries.
    pub fn build_binary_targets(&mut self) -> Result<()> {
        let build_dir = self.prepare_source()?;
        let options = self.build_options()?;
        info!(dir = %build_dir.display(), "building load generator binaries");
        self.context.run_build_tool(
            &format!("bazel build {options} {LOADGEN_BINARY_TARGETS}"),
            &build_dir,
        )?;
        Ok(())
    }

    // The image scripts tag their output "latest"; the tag is not
    // configurable from here.
    pub fn build_benchmark_image(&mut self) -> Result<()> {
        self.run_image_script(LOADGEN_BENCHMARK_IMAGE_SCRIPT)
    }

    pub fn build_binary_image(&mut self) -> Result<()> {
        self.run_image_script(LOADGEN_BINARY_IMAGE_SCRIPT)
    }

    fn run_image_script(&mut self, script: &str) -> Result<()> {
        let build_dir = self.prepare_source()?;
        info!(script, "building load generator image");
        let output = self.context.run_build_tool(script, &build_dir)?;
        debug!(script, bytes = output.len(), "image script output");
        Ok(())
    }

    /// Run the built benchmark driver; used by the scavenging strategy. The
    /// child inherits the process environment installed by the caller's
    /// scope.
    pub fn run_benchmark_driver(&mut self, args: &str) -> Result<String> {
        let build_dir = self.prepare_source()?;
        cmd_exec::run(&format!("{LOADGEN_BENCHMARK_BINARY} {args}"), &build_dir)
    }

    /// Run the build tool's test runner over the benchmark targets; used by
    /// the binary strategy. The child inherits the caller's scope.
    pub fn run_benchmark_tests(&mut self) -> Result<String> {
        let build_dir = self.prepare_source()?;
        let options = self.build_options()?;
        self.context.run_build_tool(
            &format!(
                "bazel test {options} --test_summary=detailed --test_output=all \
                 --test_arg=--log-cli-level=info --cache_test_results=no \
                 {LOADGEN_TEST_TARGETS}"
            ),
            &build_dir,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_default_to_optimized() {
        assert_eq!(compose_build_options(&[]), "-c opt");
        let options = vec!["--jobs 4".to_string()];
        assert_eq!(compose_build_options(&options), "--jobs 4 -c opt");
    }

    #[test]
    fn explicit_build_mode_suppresses_default() {
        let options = vec!["-c dbg".to_string()];
        assert_eq!(compose_build_options(&options), "-c dbg");
    }

    #[test]
    fn duplicate_options_collapse() {
        let options = vec![
            "--jobs 4".to_string(),
            "--jobs 4".to_string(),
            "--verbose_failures".to_string(),
        ];
        assert_eq!(
            compose_build_options(&options),
            "--jobs 4 --verbose_failures -c opt"
        );
    }

    #[test]
    fn clang_probe_returns_first_match() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        std::fs::write(second.path().join("clang"), "").expect("write");

        let paths = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(find_clang_in(&paths), Some(second.path().to_path_buf()));

        std::fs::write(first.path().join("clang"), "").expect("write");
        assert_eq!(find_clang_in(&paths), Some(first.path().to_path_buf()));

        assert_eq!(find_clang_in(&[]), None);
    }

    #[test]
    fn docker_ignore_excludes_all_but_staging_and_dockerfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        generate_docker_ignore(dir.path()).expect("ignore");
        let contents = std::fs::read_to_string(dir.path().join(".dockerignore")).expect("read");
        assert_eq!(contents, "*\n!build_release/\n!ci/Dockerfile-proxy\n");
    }

    #[test]
    fn build_context_isolates_home() {
        let context = BuildContext::new().expect("context");
        let env = context.child_env();
        let home = env
            .iter()
            .find(|(k, _)| *k == "HOME")
            .map(|(_, v)| *v)
            .expect("HOME binding");
        assert_ne!(Some(home.to_string()), std::env::var("HOME").ok());
        assert!(Path::new(home).is_dir());
    }
}
