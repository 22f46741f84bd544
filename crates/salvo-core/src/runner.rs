//! Drive a benchmark run end to end.
//!
//! The runner resolves the benchmark points, makes the required images
//! available, lays out one output directory per point and executes one
//! strategy per point, sequentially and in point order. A failing point is
//! recorded and its siblings continue; global precondition failures abort
//! the run.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::{error, info};

use crate::benchmark;
use crate::constants::{LOADGEN_BENCHMARK_IMAGE_DEFAULT, LOADGEN_BINARY_IMAGE_DEFAULT};
use crate::docker::{self, proxy_image_name, DockerClient};
use crate::error::{Error, Result};
use crate::job_control::{ImageSet, JobControl, Mode};
use crate::source_manager::SourceManager;

/// Result of one benchmark point.
#[derive(Debug)]
pub struct PointOutcome {
    pub point: String,
    pub error: Option<String>,
}

/// Per-point results of a whole run, in execution order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<PointOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }

    fn record(&mut self, point: &str, error: Option<String>) {
        self.outcomes.push(PointOutcome {
            point: point.to_string(),
            error,
        });
    }
}

/// A benchmark compares at least two proxy versions unless the job control
/// explicitly asks for a single one.
fn check_cardinality(points: &BTreeSet<String>, control: &JobControl) -> Result<()> {
    let single_requested = control
        .images
        .as_ref()
        .map(|i| i.test_single_image)
        .unwrap_or(false)
        || control.sources.iter().any(|s| s.test_single_commit);
    if points.len() < 2 && !single_requested {
        return Err(Error::Config("missing image name for benchmark".to_string()));
    }
    Ok(())
}

/// Specialize the job control for one benchmark point: canonical proxy image
/// name, per-point output directory, default load-generator image names.
fn point_control(control: &JobControl, point: &str) -> JobControl {
    let mut specialized = control.clone();
    let images = specialized.images.get_or_insert_with(ImageSet::default);
    images.proxy_image = proxy_image_name(point);
    if images.loadgen_benchmark_image.is_empty() {
        images.loadgen_benchmark_image = LOADGEN_BENCHMARK_IMAGE_DEFAULT.to_string();
    }
    if images.loadgen_binary_image.is_empty() {
        images.loadgen_binary_image = LOADGEN_BINARY_IMAGE_DEFAULT.to_string();
    }
    specialized.environment.output_dir = control.environment.output_dir.join(point);
    specialized
}

/// Point the symlink at `link` to `target`, leaving an already correct link
/// alone and replacing a stale one.
fn ensure_symlink(link: &Path, target: &Path) -> Result<()> {
    match fs::read_link(link) {
        Ok(existing) if existing == target => return Ok(()),
        Ok(_) => fs::remove_file(link)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create the per-point output directory and a convenience symlink to it in
/// the working directory.
fn prepare_point_output(point: &str, output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    let link = std::env::current_dir()?.join(point);
    ensure_symlink(&link, output_dir)
}

/// Execute a whole benchmark run described by a job control document.
pub fn execute(control: &JobControl) -> Result<RunSummary> {
    control.validate()?;
    if control.remote {
        return Err(Error::NotImplemented("remote benchmark execution"));
    }

    let mut manager = SourceManager::new(control);
    let points = manager.get_benchmark_points()?;
    check_cardinality(&points, control)?;

    let mut summary = RunSummary::default();
    let mut runnable: Vec<String> = Vec::new();

    if control.mode == Some(Mode::Binary) {
        // The binary strategy builds its own proxy; no images needed.
        runnable.extend(points.iter().cloned());
    } else {
        let mut client = DockerClient::new();
        let images = control.images.clone().unwrap_or_default();
        docker::ensure_loadgen_images(&mut client, &mut manager, &images)?;
        for point in &points {
            match docker::ensure_proxy_image(&mut client, &mut manager, point) {
                Ok(image) => {
                    info!(%point, %image, "proxy image available");
                    runnable.push(point.clone());
                }
                Err(e) => {
                    error!(%point, error = %e, "unable to provide proxy image");
                    summary.record(point, Some(e.to_string()));
                }
            }
        }
    }

    for point in &runnable {
        let specialized = point_control(control, point);
        prepare_point_output(point, &specialized.environment.output_dir)?;

        let mut strategy = benchmark::create(&specialized)?;
        strategy.validate()?;
        info!(%point, strategy = strategy.name(), "executing benchmark");
        match strategy.execute_benchmark() {
            Ok(()) => summary.record(point, None),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(%point, error = %e, "benchmark point failed");
                summary.record(point, Some(e.to_string()));
            }
        }
    }

    Ok(summary)
}
