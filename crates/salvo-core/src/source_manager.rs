//! Resolve the set of benchmark points and hand out source trees.
//!
//! The manager owns one [`SourceTree`] per identity and implements the point
//! resolution at the heart of a run: from the images and sources named by the
//! job control, derive the tags and commit hashes to benchmark.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::constants::DEFAULT_PROXY_REMOTE;
use crate::error::{Error, Result};
use crate::job_control::{JobControl, SourceIdentity, SourceRepository};
use crate::source_tree::SourceTree;

/// Extract the tag suffix from a fully qualified image name.
pub fn image_tag(image: &str) -> Result<String> {
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => Ok(tag.to_string()),
        _ => Err(Error::Source(format!("image name `{image}` has no tag"))),
    }
}

/// Owner of the source trees for one run.
pub struct SourceManager {
    control: JobControl,
    trees: BTreeMap<SourceIdentity, SourceTree>,
}

impl SourceManager {
    pub fn new(control: &JobControl) -> Self {
        Self {
            control: control.clone(),
            trees: BTreeMap::new(),
        }
    }

    /// Return the source repository with the given identity, filling in the
    /// built-in default remote for the proxy when none is configured.
    pub fn get_source_repository(&self, identity: SourceIdentity) -> Result<SourceRepository> {
        let mut repo = self
            .control
            .source(identity)
            .cloned()
            .ok_or_else(|| {
                Error::Source(format!("no source with identity {}", identity.as_str()))
            })?;
        if !repo.is_usable() && identity == SourceIdentity::ProxyUnderTest {
            debug!(remote = DEFAULT_PROXY_REMOTE, "using default proxy remote");
            repo.source_url = Some(DEFAULT_PROXY_REMOTE.to_string());
        }
        Ok(repo)
    }

    /// Hand out the tree for an identity, creating it on first use. At most
    /// one tree, and hence one working copy, exists per identity.
    pub fn get_source_tree(&mut self, identity: SourceIdentity) -> Result<&mut SourceTree> {
        if !self.trees.contains_key(&identity) {
            let repo = self.get_source_repository(identity)?;
            self.trees.insert(identity, SourceTree::new(repo));
        }
        Ok(self.trees.get_mut(&identity).expect("tree just inserted"))
    }

    /// Whether the identified source carries build options. The runner uses
    /// this to rebuild even when a cached image exists.
    pub fn have_build_options(&self, identity: SourceIdentity) -> bool {
        self.control
            .source(identity)
            .map(|s| !s.build_options.is_empty())
            .unwrap_or(false)
    }

    /// Resolve the benchmark points of this run: the union of the points
    /// named by images and the points named by sources. An empty union is an
    /// error.
    pub fn get_benchmark_points(&mut self) -> Result<BTreeSet<String>> {
        let mut first_error = None;

        let from_images = match self.points_from_images() {
            Ok(points) => points,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "unable to resolve points from images");
                first_error = Some(e);
                BTreeSet::new()
            }
        };

        let from_sources = match self.points_from_sources() {
            Ok(points) => points,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "unable to resolve points from sources");
                first_error.get_or_insert(e);
                BTreeSet::new()
            }
        };

        let mut points = from_images;
        points.extend(from_sources);
        if points.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                Error::Config(
                    "no benchmark points could be determined from images or sources".to_string(),
                )
            }));
        }
        info!(?points, "resolved benchmark points");
        Ok(points)
    }

    /// Points named by the image set: tag suffixes of the configured proxy
    /// images, with a predecessor deduced when only the baseline is named.
    fn points_from_images(&mut self) -> Result<BTreeSet<String>> {
        let images = self.control.images.clone().unwrap_or_default();

        let loadgen_source_usable = self
            .control
            .source(SourceIdentity::LoadGenerator)
            .map(|s| s.is_usable())
            .unwrap_or(false);
        if !images.have_loadgen_images() && !loadgen_source_usable {
            return Err(Error::Config(
                "the load generator images or source must be specified".to_string(),
            ));
        }

        if images.proxy_image.is_empty() {
            return Ok(BTreeSet::new());
        }
        if images.test_single_image && !images.additional_images.is_empty() {
            return Err(Error::Config(
                "test_single_image and additional_images are mutually exclusive".to_string(),
            ));
        }

        let baseline = image_tag(&images.proxy_image)?;
        let mut points = BTreeSet::new();
        if !images.additional_images.is_empty() {
            for image in &images.additional_images {
                points.insert(image_tag(image)?);
            }
            points.insert(baseline);
        } else if images.test_single_image {
            points.insert(baseline);
        } else {
            let previous = self.previous_point(&baseline)?;
            debug!(%baseline, %previous, "deduced predecessor image point");
            points.insert(previous);
            points.insert(baseline);
        }
        Ok(points)
    }

    /// Points named by the proxy source: its commit hash plus either the
    /// additional hashes or a deduced predecessor.
    fn points_from_sources(&mut self) -> Result<BTreeSet<String>> {
        let Some(repo) = self.control.source(SourceIdentity::ProxyUnderTest).cloned() else {
            return Ok(BTreeSet::new());
        };
        if repo.test_single_commit && !repo.additional_hashes.is_empty() {
            return Err(Error::Config(
                "test_single_commit and additional_hashes are mutually exclusive".to_string(),
            ));
        }
        let Some(hash) = repo.commit_hash.clone() else {
            return Ok(BTreeSet::new());
        };

        let mut points = BTreeSet::new();
        if !repo.additional_hashes.is_empty() {
            points.extend(repo.additional_hashes.iter().cloned());
            points.insert(hash);
        } else if repo.test_single_commit {
            points.insert(hash);
        } else {
            let previous = self.previous_point(&hash)?;
            debug!(baseline = %hash, previous = %previous, "deduced predecessor source point");
            points.insert(previous);
            points.insert(hash);
        }
        Ok(points)
    }

    fn previous_point(&mut self, point: &str) -> Result<String> {
        let tree = self.get_source_tree(SourceIdentity::ProxyUnderTest)?;
        tree.get_previous_commit_hash(point, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::{Environment, ImageSet, Mode};

    fn loadgen_images() -> ImageSet {
        ImageSet {
            loadgen_benchmark_image: "salvoloadgen/benchmark:latest".to_string(),
            loadgen_binary_image: "salvoloadgen/binary:latest".to_string(),
            ..ImageSet::default()
        }
    }

    fn control_with_images(images: ImageSet) -> JobControl {
        JobControl {
            mode: Some(Mode::FullyDockerized),
            images: Some(images),
            environment: Environment::default(),
            ..JobControl::default()
        }
    }

    #[test]
    fn image_tag_takes_suffix_after_last_colon() {
        assert_eq!(image_tag("salvoproxy/proxy:v1.2.3").unwrap(), "v1.2.3");
        assert_eq!(
            image_tag("registry:5000/salvoproxy/proxy-dev:abc123").unwrap(),
            "abc123"
        );
        assert!(image_tag("salvoproxy/proxy").is_err());
        assert!(image_tag("salvoproxy/proxy:").is_err());
    }

    #[test]
    fn additional_images_skip_predecessor_deduction() {
        let mut images = loadgen_images();
        images.proxy_image = "salvoproxy/proxy:v1.2.3".to_string();
        images.additional_images = vec!["salvoproxy/proxy:v1.2.2".to_string()];
        let mut manager = SourceManager::new(&control_with_images(images));
        let points = manager.get_benchmark_points().expect("points");
        let expected: BTreeSet<String> =
            ["v1.2.2", "v1.2.3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(points, expected);
    }

    #[test]
    fn single_image_yields_one_point() {
        let mut images = loadgen_images();
        images.proxy_image = "salvoproxy/proxy-dev:abc123".to_string();
        images.test_single_image = true;
        let mut manager = SourceManager::new(&control_with_images(images));
        let points = manager.get_benchmark_points().expect("points");
        assert_eq!(points.len(), 1);
        assert!(points.contains("abc123"));
    }

    #[test]
    fn missing_loadgen_images_and_source_is_fatal() {
        let mut images = ImageSet::default();
        images.proxy_image = "salvoproxy/proxy:v1.2.3".to_string();
        let mut manager = SourceManager::new(&control_with_images(images));
        let err = manager.get_benchmark_points().expect_err("must fail");
        assert!(matches!(err, Error::Config(_)), "unexpected error: {err}");
    }

    #[test]
    fn additional_hashes_union_with_commit_hash() {
        let mut control = control_with_images(loadgen_images());
        control.sources.push(SourceRepository {
            identity: Some(SourceIdentity::ProxyUnderTest),
            source_url: Some("https://example.com/proxy.git".to_string()),
            commit_hash: Some("abc123".to_string()),
            additional_hashes: vec!["def456".to_string(), "0123aa".to_string()],
            ..SourceRepository::default()
        });
        let mut manager = SourceManager::new(&control);
        let points = manager.get_benchmark_points().expect("points");
        let expected: BTreeSet<String> = ["abc123", "def456", "0123aa"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(points, expected);
    }

    #[test]
    fn single_commit_yields_one_point() {
        let mut control = control_with_images(loadgen_images());
        control.sources.push(SourceRepository {
            identity: Some(SourceIdentity::ProxyUnderTest),
            source_url: Some("https://example.com/proxy.git".to_string()),
            commit_hash: Some("abc123".to_string()),
            test_single_commit: true,
            ..SourceRepository::default()
        });
        let mut manager = SourceManager::new(&control);
        let points = manager.get_benchmark_points().expect("points");
        assert_eq!(points.len(), 1);
        assert!(points.contains("abc123"));
    }

    #[test]
    fn images_and_sources_union() {
        let mut images = loadgen_images();
        images.proxy_image = "salvoproxy/proxy:v1.2.3".to_string();
        images.additional_images = vec!["salvoproxy/proxy:v1.2.2".to_string()];
        let mut control = control_with_images(images);
        control.sources.push(SourceRepository {
            identity: Some(SourceIdentity::ProxyUnderTest),
            source_url: Some("https://example.com/proxy.git".to_string()),
            commit_hash: Some("abc123".to_string()),
            test_single_commit: true,
            ..SourceRepository::default()
        });
        let mut manager = SourceManager::new(&control);
        let points = manager.get_benchmark_points().expect("points");
        let expected: BTreeSet<String> = ["v1.2.2", "v1.2.3", "abc123"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(points, expected);
    }

    #[test]
    fn no_points_at_all_is_an_error() {
        let control = control_with_images(loadgen_images());
        let mut manager = SourceManager::new(&control);
        assert!(manager.get_benchmark_points().is_err());
    }

    #[test]
    fn default_remote_fills_in_for_bare_proxy_identity() {
        let mut control = control_with_images(loadgen_images());
        control.sources.push(SourceRepository {
            identity: Some(SourceIdentity::ProxyUnderTest),
            ..SourceRepository::default()
        });
        let manager = SourceManager::new(&control);
        let repo = manager
            .get_source_repository(SourceIdentity::ProxyUnderTest)
            .expect("repo");
        assert_eq!(repo.source_url.as_deref(), Some(DEFAULT_PROXY_REMOTE));

        let err = manager
            .get_source_repository(SourceIdentity::LoadGenerator)
            .expect_err("must fail");
        assert!(matches!(err, Error::Source(_)));
    }

    #[test]
    fn build_options_are_reported_per_identity() {
        let mut control = control_with_images(loadgen_images());
        control.sources.push(SourceRepository {
            identity: Some(SourceIdentity::ProxyUnderTest),
            source_url: Some("https://example.com/proxy.git".to_string()),
            build_options: vec!["--config=clang".to_string()],
            ..SourceRepository::default()
        });
        let manager = SourceManager::new(&control);
        assert!(manager.have_build_options(SourceIdentity::ProxyUnderTest));
        assert!(!manager.have_build_options(SourceIdentity::LoadGenerator));
    }
}
