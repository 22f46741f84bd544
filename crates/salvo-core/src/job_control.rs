//! Job control model and document loader.
//!
//! A job control document names the candidate proxy builds, the images or
//! sources they come from, the benchmark mode and the environment under
//! which the benchmark children run. Documents are JSON or YAML; both
//! grammars deserialize into the same [`JobControl`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Benchmark execution strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    FullyDockerized,
    Scavenging,
    Binary,
}

/// Identity of a source repository in the job control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceIdentity {
    Unspecified,
    ProxyUnderTest,
    LoadGenerator,
}

impl SourceIdentity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceIdentity::Unspecified => "unspecified",
            SourceIdentity::ProxyUnderTest => "proxy-under-test",
            SourceIdentity::LoadGenerator => "load-generator",
        }
    }
}

/// One upstream code origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceRepository {
    pub identity: Option<SourceIdentity>,
    /// Local directory holding a checkout; exclusive with `source_url` as the
    /// primary origin, though both may be present after a pull.
    pub source_path: Option<PathBuf>,
    /// Remote clone URL.
    pub source_url: Option<String>,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    /// Benchmark only `commit_hash`, skipping predecessor deduction.
    pub test_single_commit: bool,
    /// Hashes or tags benchmarked in addition to `commit_hash`.
    pub additional_hashes: Vec<String>,
    /// Opaque option strings forwarded to the build tool.
    pub build_options: Vec<String>,
}

impl SourceRepository {
    /// A source is usable when it points somewhere we can clone or copy from.
    pub fn is_usable(&self) -> bool {
        self.source_path.is_some() || self.source_url.is_some()
    }
}

/// Container images named by the job control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSet {
    /// Full tagged name for the subject proxy image; empty means derive the
    /// image from sources.
    pub proxy_image: String,
    pub loadgen_benchmark_image: String,
    pub loadgen_binary_image: String,
    /// Benchmark only the named proxy image, skipping predecessor deduction.
    pub test_single_image: bool,
    /// Extra proxy images to benchmark.
    pub additional_images: Vec<String>,
}

impl ImageSet {
    pub fn have_loadgen_images(&self) -> bool {
        !self.loadgen_benchmark_image.is_empty() && !self.loadgen_binary_image.is_empty()
    }
}

/// IP family the benchmark children are confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpFamily {
    V4Only,
    V6Only,
}

impl IpFamily {
    /// Value exported as `IP_FAMILY` into benchmark children.
    pub fn as_env_value(&self) -> &'static str {
        match self {
            IpFamily::V4Only => "v4only",
            IpFamily::V6Only => "v6only",
        }
    }
}

/// Environment block installed around benchmark child processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub ip_family: Option<IpFamily>,
    /// Absolute path to a native proxy binary; binary mode only.
    pub proxy_path: Option<PathBuf>,
    /// Mounted read-write into containers; receives all benchmark artifacts.
    pub output_dir: PathBuf,
    /// Mounted read-only into containers; user supplied tests.
    pub test_dir: Option<PathBuf>,
    /// User variable bag exported verbatim into the scope.
    pub variables: BTreeMap<String, String>,
}

/// Root record of a job control document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobControl {
    pub mode: Option<Mode>,
    /// Remote execution is a stub that fails fast.
    pub remote: bool,
    pub sources: Vec<SourceRepository>,
    pub images: Option<ImageSet>,
    pub environment: Environment,
}

impl JobControl {
    /// Check the global preconditions of a run. Per-strategy requirements
    /// are validated by the strategy itself.
    pub fn validate(&self) -> Result<()> {
        if self.mode.is_none() {
            return Err(Error::Config("no benchmark mode selected".to_string()));
        }

        let mut seen = BTreeSet::new();
        for source in &self.sources {
            let identity = match source.identity {
                None | Some(SourceIdentity::Unspecified) => {
                    return Err(Error::Config("source has no identity specified".to_string()))
                }
                Some(identity) => identity,
            };
            if !seen.insert(identity) {
                return Err(Error::Config(format!(
                    "duplicate source identity: {}",
                    identity.as_str()
                )));
            }
            if source.test_single_commit && !source.additional_hashes.is_empty() {
                return Err(Error::Config(
                    "test_single_commit and additional_hashes are mutually exclusive".to_string(),
                ));
            }
        }

        if let Some(images) = &self.images {
            if images.test_single_image && !images.additional_images.is_empty() {
                return Err(Error::Config(
                    "test_single_image and additional_images are mutually exclusive".to_string(),
                ));
            }
        }

        for key in self.environment.variables.keys() {
            if key.is_empty() {
                return Err(Error::Config(
                    "environment variable names must be non-empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Return the source repository with the given identity, if any.
    pub fn source(&self, identity: SourceIdentity) -> Option<&SourceRepository> {
        self.sources
            .iter()
            .find(|s| s.identity == Some(identity))
    }
}

fn load_json_doc(contents: &str) -> Result<JobControl> {
    serde_json::from_str(contents).map_err(|e| Error::Parse(e.to_string()))
}

fn load_yaml_doc(contents: &str) -> Result<JobControl> {
    serde_yaml::from_str(contents).map_err(|e| Error::Parse(e.to_string()))
}

/// Load a job control document from disk.
///
/// The extension selects the parser; without a recognized extension the
/// contents are tried as JSON first, then YAML, reporting the first
/// successful parse.
pub fn load_control_doc(path: &Path) -> Result<JobControl> {
    let contents = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            debug!(path = %path.display(), "loading job control as JSON");
            load_json_doc(&contents)
        }
        Some("yaml") | Some("yml") => {
            debug!(path = %path.display(), "loading job control as YAML");
            load_yaml_doc(&contents)
        }
        _ => {
            debug!(path = %path.display(), "auto-detecting job control format");
            match load_json_doc(&contents) {
                Ok(control) => Ok(control),
                Err(json_err) => load_yaml_doc(&contents).map_err(|yaml_err| {
                    Error::Parse(format!(
                        "not valid JSON ({json_err}) nor YAML ({yaml_err})"
                    ))
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_doc() -> &'static str {
        r#"
        {
          "mode": "fully-dockerized",
          "sources": [
            {
              "identity": "proxy-under-test",
              "source_url": "https://example.com/proxy.git",
              "commit_hash": "abc123"
            }
          ],
          "environment": {
            "ip_family": "v4-only",
            "output_dir": "/tmp/out"
          }
        }
        "#
    }

    #[test]
    fn json_doc_parses_into_job_control() {
        let control = load_json_doc(minimal_doc()).expect("parse");
        assert_eq!(control.mode, Some(Mode::FullyDockerized));
        assert!(!control.remote);
        let source = control
            .source(SourceIdentity::ProxyUnderTest)
            .expect("proxy source");
        assert_eq!(source.commit_hash.as_deref(), Some("abc123"));
        assert_eq!(control.environment.ip_family, Some(IpFamily::V4Only));
    }

    #[test]
    fn auto_detect_matches_explicit_parse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_path = dir.path().join("job.json");
        std::fs::write(&json_path, minimal_doc()).expect("write");
        let extensionless = dir.path().join("job");
        std::fs::write(&extensionless, minimal_doc()).expect("write");

        let explicit = load_control_doc(&json_path).expect("explicit load");
        let detected = load_control_doc(&extensionless).expect("auto load");
        assert_eq!(
            serde_json::to_value(&explicit).unwrap(),
            serde_json::to_value(&detected).unwrap()
        );
    }

    #[test]
    fn yaml_doc_parses_via_auto_detect() {
        let yaml = "
mode: binary
remote: false
sources:
  - identity: load-generator
    source_path: /src/loadgen
environment:
  ip_family: v6-only
  output_dir: /tmp/out
  variables:
    FOO: bar
";
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job.conf");
        std::fs::write(&path, yaml).expect("write");
        let control = load_control_doc(&path).expect("load");
        assert_eq!(control.mode, Some(Mode::Binary));
        assert_eq!(
            control.environment.variables.get("FOO").map(String::as_str),
            Some("bar")
        );
    }

    #[test]
    fn unparseable_doc_reports_both_grammars() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job");
        std::fs::write(&path, "mode: [unbalanced").expect("write");
        let err = load_control_doc(&path).expect_err("must fail");
        assert!(matches!(err, Error::Parse(_)), "unexpected error: {err}");
    }

    #[test]
    fn validate_rejects_missing_mode() {
        let control = JobControl::default();
        let err = control.validate().expect_err("must fail");
        assert!(err.to_string().contains("no benchmark mode"));
    }

    #[test]
    fn validate_rejects_duplicate_identities() {
        let mut control = load_json_doc(minimal_doc()).expect("parse");
        control.sources.push(control.sources[0].clone());
        let err = control.validate().expect_err("must fail");
        assert!(err.to_string().contains("duplicate source identity"));
    }

    #[test]
    fn validate_rejects_unspecified_identity() {
        let mut control = load_json_doc(minimal_doc()).expect("parse");
        control.sources[0].identity = Some(SourceIdentity::Unspecified);
        assert!(control.validate().is_err());
    }

    #[test]
    fn validate_rejects_single_commit_with_additional_hashes() {
        let mut control = load_json_doc(minimal_doc()).expect("parse");
        control.sources[0].test_single_commit = true;
        control.sources[0].additional_hashes = vec!["def456".to_string()];
        let err = control.validate().expect_err("must fail");
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn validate_rejects_single_image_with_additional_images() {
        let mut control = load_json_doc(minimal_doc()).expect("parse");
        control.images = Some(ImageSet {
            proxy_image: "salvoproxy/proxy-dev:latest".to_string(),
            test_single_image: true,
            additional_images: vec!["salvoproxy/proxy-dev:old".to_string()],
            ..ImageSet::default()
        });
        assert!(control.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_variable_names() {
        let mut control = load_json_doc(minimal_doc()).expect("parse");
        control
            .environment
            .variables
            .insert(String::new(), "x".to_string());
        assert!(control.validate().is_err());
    }
}
