//! Container runtime access: image naming, pull-or-build, volume maps and
//! running the benchmark container.
//!
//! All operations shell out to the `docker` client binary through the
//! command runner; there is no long-lived daemon connection to manage.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cmd_exec;
use crate::constants::{
    DOCKER_SOCKET_PATH, LOADGEN_EXTERNAL_TEST_DIR, PROXY_IMAGE_DEV_PREFIX,
    PROXY_IMAGE_RELEASE_PREFIX, SALVO_TMP,
};
use crate::error::Result;
use crate::job_control::Environment;
use crate::source_tree::is_release_tag;

/// Canonical proxy image name for a benchmark point: release prefix for
/// version tags, development prefix for commit hashes.
pub fn proxy_image_name(tag: &str) -> String {
    if is_release_tag(tag) {
        format!("{PROXY_IMAGE_RELEASE_PREFIX}:{tag}")
    } else {
        format!("{PROXY_IMAGE_DEV_PREFIX}:{tag}")
    }
}

/// One bind mount passed to `docker run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub bind: PathBuf,
    pub read_only: bool,
}

impl VolumeMount {
    fn as_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.bind.display(),
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Mount map for a benchmark container: the docker socket and the output
/// directory read-write at their host paths, the optional test directory
/// read-only at the fixed in-container test path.
pub fn benchmark_volumes(environment: &Environment) -> Vec<VolumeMount> {
    let mut volumes = vec![
        VolumeMount {
            host: PathBuf::from(DOCKER_SOCKET_PATH),
            bind: PathBuf::from(DOCKER_SOCKET_PATH),
            read_only: false,
        },
        VolumeMount {
            host: environment.output_dir.clone(),
            bind: environment.output_dir.clone(),
            read_only: false,
        },
    ];
    if let Some(test_dir) = &environment.test_dir {
        volumes.push(VolumeMount {
            host: test_dir.clone(),
            bind: PathBuf::from(LOADGEN_EXTERNAL_TEST_DIR),
            read_only: true,
        });
    }
    volumes
}

/// Invocation parameters for one container run.
#[derive(Debug, Clone, Default)]
pub struct RunParameters {
    pub environment: Vec<(String, String)>,
    pub command: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    /// Network stack shared with the host when set.
    pub host_network: bool,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
}

/// Assemble the `docker run` command line for an image and its parameters.
fn run_command(image: &str, params: &RunParameters) -> String {
    let mut argv = vec!["docker".to_string(), "run".to_string(), "--rm".to_string()];
    if params.host_network {
        argv.push("--network".to_string());
        argv.push("host".to_string());
    }
    if params.tty {
        argv.push("-t".to_string());
    }
    for (key, value) in &params.environment {
        argv.push("-e".to_string());
        argv.push(format!("{key}={value}"));
    }
    for volume in &params.volumes {
        argv.push("-v".to_string());
        argv.push(volume.as_arg());
    }
    argv.push(image.to_string());
    argv.extend(params.command.iter().cloned());
    shell_words::join(argv.iter().map(String::as_str))
}

fn runtime_workdir() -> Result<PathBuf> {
    let dir = PathBuf::from(SALVO_TMP);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Containers running in `after` that were not running in `before`; these
/// are ours (or started on our behalf) and get stopped by the reaper.
fn new_containers(before: &[String], after: &[String]) -> Vec<String> {
    after
        .iter()
        .filter(|name| !before.contains(name))
        .cloned()
        .collect()
}

/// Wrapper around the docker client binary with caches of what is already
/// present on the host and what has been pulled this run.
#[derive(Default)]
pub struct DockerClient {
    pulled: BTreeSet<String>,
}

impl DockerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// All image tags present on the local host.
    pub fn list_images(&self) -> Result<Vec<String>> {
        let dir = runtime_workdir()?;
        let output = cmd_exec::run("docker images --format {{.Repository}}:{{.Tag}}", &dir)?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Pull an image unless it is already on the host or was pulled earlier
    /// in this run.
    pub fn pull_image(&mut self, image_name: &str) -> Result<()> {
        if self.pulled.contains(image_name) {
            return Ok(());
        }
        if self.list_images()?.iter().any(|i| i == image_name) {
            debug!(image = image_name, "image already present on host");
            self.pulled.insert(image_name.to_string());
            return Ok(());
        }
        info!(image = image_name, "pulling image");
        let dir = runtime_workdir()?;
        cmd_exec::run_check(&format!("docker pull {image_name}"), &dir)?;
        self.pulled.insert(image_name.to_string());
        Ok(())
    }

    /// Names of currently running containers.
    pub fn list_processes(&self) -> Result<Vec<String>> {
        let dir = runtime_workdir()?;
        let output = cmd_exec::run("docker ps --format {{.Names}}", &dir)?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn stop_container(&self, name: &str) -> Result<()> {
        let dir = runtime_workdir()?;
        cmd_exec::run_check(&format!("docker stop {name}"), &dir)
    }

    /// Run an image to completion and return its combined output. Containers
    /// started while the image runs and still alive afterwards are stopped,
    /// whether the run succeeded or not.
    pub fn run_image(&self, image_name: &str, params: &RunParameters) -> Result<String> {
        let before = self.list_processes()?;
        let dir = runtime_workdir()?;
        let result = cmd_exec::run(&run_command(image_name, params), &dir);

        let after = self.list_processes().unwrap_or_default();
        for name in new_containers(&before, &after) {
            debug!(container = %name, "stopping lingering container");
            if let Err(e) = self.stop_container(&name) {
                warn!(container = %name, error = %e, "unable to stop container");
            }
        }
        result
    }

    /// Build an image from a Dockerfile in `context_dir`.
    pub fn build_image(&self, tag: &str, dockerfile: &Path, context_dir: &Path) -> Result<()> {
        info!(image = tag, "building image");
        cmd_exec::run_check(
            &format!("docker build -f {} -t {tag} .", dockerfile.display()),
            context_dir,
        )
    }
}

/// Make the proxy image for a benchmark point available on the host:
/// attempt a pull, falling back to a source build when the pull fails or
/// when build options force a rebuild. Returns the canonical image name.
pub fn ensure_proxy_image(
    client: &mut DockerClient,
    manager: &mut crate::source_manager::SourceManager,
    tag: &str,
) -> Result<String> {
    let image = proxy_image_name(tag);
    if !manager.have_build_options(crate::job_control::SourceIdentity::ProxyUnderTest) {
        match client.pull_image(&image) {
            Ok(()) => return Ok(image),
            Err(e) => warn!(%image, error = %e, "pull failed; building proxy from source"),
        }
    }
    let mut builder = crate::builder::ProxyBuilder::new(manager)?;
    builder.build_proxy_image_from_source(tag)
}

/// Make both load-generator images available on the host, building from
/// source any image that is unnamed, unpullable or forced by build options.
pub fn ensure_loadgen_images(
    client: &mut DockerClient,
    manager: &mut crate::source_manager::SourceManager,
    images: &crate::job_control::ImageSet,
) -> Result<()> {
    let rebuild =
        manager.have_build_options(crate::job_control::SourceIdentity::LoadGenerator);
    let mut need_benchmark = rebuild || images.loadgen_benchmark_image.is_empty();
    let mut need_binary = rebuild || images.loadgen_binary_image.is_empty();

    if !need_benchmark {
        if let Err(e) = client.pull_image(&images.loadgen_benchmark_image) {
            warn!(image = %images.loadgen_benchmark_image, error = %e, "pull failed");
            need_benchmark = true;
        }
    }
    if !need_binary {
        if let Err(e) = client.pull_image(&images.loadgen_binary_image) {
            warn!(image = %images.loadgen_binary_image, error = %e, "pull failed");
            need_binary = true;
        }
    }

    if need_benchmark || need_binary {
        let mut builder = crate::builder::LoadGeneratorBuilder::new(manager)?;
        if need_binary {
            builder.build_binary_targets()?;
            builder.build_binary_image()?;
        }
        if need_benchmark {
            builder.build_benchmark_target()?;
            builder.build_benchmark_image()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::Environment;

    #[test]
    fn release_tags_map_to_release_prefix() {
        assert_eq!(proxy_image_name("v1.16.0"), "salvoproxy/proxy:v1.16.0");
        assert_eq!(proxy_image_name("abc123"), "salvoproxy/proxy-dev:abc123");
        assert_eq!(proxy_image_name("latest"), "salvoproxy/proxy-dev:latest");
    }

    #[test]
    fn volume_map_mounts_socket_and_output_read_write() {
        let environment = Environment {
            output_dir: PathBuf::from("/tmp/out"),
            ..Environment::default()
        };
        let volumes = benchmark_volumes(&environment);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].host, PathBuf::from(DOCKER_SOCKET_PATH));
        assert_eq!(volumes[0].bind, PathBuf::from(DOCKER_SOCKET_PATH));
        assert!(!volumes[0].read_only);
        assert_eq!(volumes[1].host, PathBuf::from("/tmp/out"));
        assert_eq!(volumes[1].bind, PathBuf::from("/tmp/out"));
        assert!(!volumes[1].read_only);
    }

    #[test]
    fn test_dir_mounts_read_only_at_fixed_container_path() {
        let environment = Environment {
            output_dir: PathBuf::from("/tmp/out"),
            test_dir: Some(PathBuf::from("/home/user/tests")),
            ..Environment::default()
        };
        let volumes = benchmark_volumes(&environment);
        assert_eq!(volumes.len(), 3);
        let test_mount = &volumes[2];
        assert_eq!(test_mount.host, PathBuf::from("/home/user/tests"));
        assert_eq!(test_mount.bind, PathBuf::from(LOADGEN_EXTERNAL_TEST_DIR));
        assert!(test_mount.read_only);
        assert_eq!(
            test_mount.as_arg(),
            format!("/home/user/tests:{LOADGEN_EXTERNAL_TEST_DIR}:ro")
        );
    }

    #[test]
    fn run_command_carries_network_tty_env_and_volumes() {
        let params = RunParameters {
            environment: vec![("PROXY_IMAGE_TO_TEST".to_string(), "p:v1".to_string())],
            command: vec!["--log-cli-level=info".to_string(), "-vvvv".to_string()],
            volumes: vec![VolumeMount {
                host: PathBuf::from("/tmp/out"),
                bind: PathBuf::from("/tmp/out"),
                read_only: false,
            }],
            host_network: true,
            tty: true,
        };
        let cmd = run_command("bench:latest", &params);
        let argv = shell_words::split(&cmd).expect("lex");
        assert_eq!(
            argv,
            vec![
                "docker",
                "run",
                "--rm",
                "--network",
                "host",
                "-t",
                "-e",
                "PROXY_IMAGE_TO_TEST=p:v1",
                "-v",
                "/tmp/out:/tmp/out:rw",
                "bench:latest",
                "--log-cli-level=info",
                "-vvvv",
            ]
        );
    }

    #[test]
    fn reaper_stops_only_newly_started_containers() {
        let before = vec!["keepme".to_string()];
        let after = vec!["keepme".to_string(), "benchmark-child".to_string()];
        assert_eq!(new_containers(&before, &after), vec!["benchmark-child"]);
        assert!(new_containers(&after, &before).is_empty());
    }
}
