//! Manage one source working copy on disk.
//!
//! A [`SourceTree`] encapsulates the git operations needed to determine the
//! endpoints of a benchmark: cloning or copying a repository, reading HEAD,
//! walking history for a predecessor commit or tag, and checking out a
//! specific hash.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::cmd_exec;
use crate::constants::{DEFAULT_COMMITTER_FILTER, SALVO_TMP};
use crate::error::{Error, Result};
use crate::job_control::{SourceIdentity, SourceRepository};

// Matches strings of the form "v1.16.0"; used to tell a release tag from a
// commit hash.
fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v\d+\.\d+\.\d+").expect("tag regex"))
}

// Matches the fetch url line of `git remote -v`, e.g.
// "origin  https://github.com/envoyproxy/envoy.git (fetch)".
fn origin_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^origin\s*([\w:@\./-]+)\s\(fetch\)$").expect("origin regex"))
}

fn ahead_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*ahead of '(.*)' by (\d+) commit").expect("ahead regex"))
}

fn up_to_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Your branch is up to date with '(.*)'").expect("utd regex"))
}

/// Whether an image tag names a release (`v<major>.<minor>.<patch>`) rather
/// than a commit hash.
pub fn is_release_tag(image_tag: &str) -> bool {
    tag_regex().is_match(image_tag)
}

/// Extract the origin fetch url from `git remote -v` output.
pub fn parse_origin(remotes: &str) -> Option<String> {
    remotes
        .lines()
        .find_map(|line| origin_regex().captures(line))
        .map(|caps| caps[1].to_string())
}

/// Number of commits the local branch is ahead of its parent, 0 if up to
/// date or the status output is unrecognized.
pub fn parse_revs_behind(status: &str) -> u32 {
    for line in status.lines() {
        if let Some(caps) = ahead_regex().captures(line) {
            let count = caps[2].parse().unwrap_or(0);
            debug!(branch = &caps[1], count, "branch is ahead of parent");
            return count;
        }
        if let Some(caps) = up_to_date_regex().captures(line) {
            debug!(branch = &caps[1], "branch is up to date");
            return 0;
        }
    }
    0
}

/// Walk `revisions` entries back from `current` in a descending tag list.
pub fn previous_tag_in_list<'a>(
    tags_descending: &'a [String],
    current: &str,
    revisions: usize,
) -> Option<&'a str> {
    let mut remaining = revisions;
    let mut counting = false;
    for tag in tags_descending {
        if counting {
            remaining -= 1;
            if remaining == 0 {
                return Some(tag);
            }
        }
        if tag == current {
            counting = true;
        }
    }
    None
}

fn temp_root() -> PathBuf {
    std::env::var("SALVO_HOMEDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(SALVO_TMP))
}

/// Create a fresh directory under the process temp root.
pub(crate) fn fresh_temp_dir(prefix: &str) -> Result<TempDir> {
    let root = temp_root();
    fs::create_dir_all(&root)?;
    Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(root)?)
}

/// Mirror `src` into `dst`, preserving directory structure. Symlinks are
/// resolved; broken links are skipped.
pub(crate) fn mirror_directory(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Source(format!("walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Source(e.to_string()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        } else if entry.file_type().is_symlink() {
            match fs::canonicalize(entry.path()) {
                Ok(real) if real.is_file() => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(real, &target)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// One checkout of one upstream repository.
pub struct SourceTree {
    repo: SourceRepository,
    committer_filter: String,
    // Materialized working copy; at most one exists at a time and it is
    // released when the tree is dropped.
    workdir: Option<TempDir>,
}

impl SourceTree {
    pub fn new(repo: SourceRepository) -> Self {
        Self {
            repo,
            committer_filter: DEFAULT_COMMITTER_FILTER.to_string(),
            workdir: None,
        }
    }

    /// Override the committer identity used to filter automation commits
    /// when walking history.
    pub fn with_committer_filter(mut self, committer: impl Into<String>) -> Self {
        self.committer_filter = committer.into();
        self
    }

    pub fn identity(&self) -> SourceIdentity {
        self.repo.identity.unwrap_or(SourceIdentity::Unspecified)
    }

    pub fn repository(&self) -> &SourceRepository {
        &self.repo
    }

    pub fn set_commit_hash(&mut self, hash: impl Into<String>) {
        self.repo.commit_hash = Some(hash.into());
    }

    fn validate(&self) -> Result<()> {
        if !self.repo.is_usable() {
            return Err(Error::Source(
                "no origin is defined or can be deduced from the path".to_string(),
            ));
        }
        Ok(())
    }

    /// Full path where the code is, or will be, checked out.
    pub fn source_directory(&mut self) -> Result<PathBuf> {
        self.validate()?;
        if let Some(dir) = &self.workdir {
            return Ok(dir.path().to_path_buf());
        }
        if let Some(path) = &self.repo.source_path {
            return Ok(path.clone());
        }
        let dir = fresh_temp_dir("salvo-src-")?;
        let path = dir.path().to_path_buf();
        self.workdir = Some(dir);
        Ok(path)
    }

    /// Detect the origin url from where the code is fetched. Falls back to
    /// parsing the remotes listing of the working copy.
    pub fn get_origin(&mut self) -> Result<String> {
        self.validate()?;
        if let Some(url) = &self.repo.source_url {
            return Ok(url.clone());
        }
        let dir = self.source_directory()?;
        let remotes = cmd_exec::run("git remote -v", &dir)?;
        match parse_origin(&remotes) {
            Some(url) => {
                self.repo.source_url = Some(url.clone());
                Ok(url)
            }
            None => Err(Error::Source(format!(
                "unable to determine the origin url from {}",
                dir.display()
            ))),
        }
    }

    /// Retrieve the code from the repository.
    ///
    /// Succeeds without work when the working copy is already on disk and up
    /// to date; otherwise clones the origin into the working directory.
    pub fn pull(&mut self) -> Result<bool> {
        self.validate()?;
        debug!(
            identity = self.identity().as_str(),
            origin = self.repo.source_url.as_deref().unwrap_or(""),
            "pulling source"
        );

        match self.is_up_to_date() {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            // A failing status probe means the source is not on disk yet.
            Err(_) => info!("source likely does not exist on disk"),
        }

        let origin = self.get_origin()?;
        let dir = self.source_directory()?;
        let output = cmd_exec::run(&format!("git clone {origin} ."), &dir)?;
        Ok(output.contains("Cloning into '.'"))
    }

    /// Mirror the configured `source_path` into a fresh working copy; used
    /// when cloning is not wanted or not possible.
    pub fn copy_source_directory(&mut self) -> Result<PathBuf> {
        let src = self
            .repo
            .source_path
            .clone()
            .ok_or_else(|| Error::Source("no source path to copy from".to_string()))?;
        // Replace any previous copy; a tree owns at most one at a time.
        self.workdir = None;
        let dir = fresh_temp_dir("salvo-src-")?;
        mirror_directory(&src, dir.path())?;
        let path = dir.path().to_path_buf();
        self.workdir = Some(dir);
        debug!(from = %src.display(), to = %path.display(), "copied source directory");
        Ok(path)
    }

    /// Check out the configured commit hash, verifying the post-checkout
    /// HEAD line mentions the requested prefix. A missing hash is a no-op.
    pub fn checkout_commit_hash(&mut self) -> Result<()> {
        self.validate()?;
        if self.workdir.is_none() && self.repo.source_path.is_none() {
            debug!("no local working copy; cloning for hash discovery");
            self.pull()?;
        }
        let Some(hash) = self.repo.commit_hash.clone() else {
            return Ok(());
        };
        let dir = self.source_directory()?;
        let output = cmd_exec::run(&format!("git checkout {hash}"), &dir)?;
        let prefix = &hash[..hash.len().min(8)];
        let expected = format!("HEAD is now at {prefix}");
        if !output.contains(&expected) {
            return Err(Error::Source(format!(
                "checkout of {hash} did not land on the expected commit: {output}"
            )));
        }
        Ok(())
    }

    /// Hash of the most recent non-merge commit by the configured committer,
    /// skipping release-automation commits.
    pub fn get_head_hash(&mut self) -> Result<String> {
        self.validate()?;
        let dir = self.source_directory()?;
        let cmd = format!(
            "git rev-list --no-merges --committer='{}' --max-count=1 HEAD",
            self.committer_filter
        );
        cmd_exec::run(&cmd, &dir)
    }

    /// Walk `revisions` non-merge commits starting at `current` and return
    /// the earliest, so `revisions = 2` yields the predecessor of `current`.
    ///
    /// A release tag delegates to [`SourceTree::get_previous_tag`]; the
    /// literal `latest` resolves to the head hash first.
    pub fn get_previous_commit_hash(&mut self, current: &str, revisions: usize) -> Result<String> {
        self.pull()?;

        debug!(current, "finding previous commit");
        if is_release_tag(current) {
            info!(current, "current commit is a tag");
            return self.get_previous_tag(current, 1);
        }

        let current = if current == "latest" {
            self.get_head_hash()?
        } else {
            current.to_string()
        };

        let dir = self.source_directory()?;
        let cmd = format!(
            "git rev-list --no-merges --committer='{}' --max-count={revisions} {current}",
            self.committer_filter
        );
        let hash_list = match cmd_exec::run(&cmd, &dir) {
            Ok(out) => out,
            Err(Error::ProcessFailure { output, .. })
                if output.contains("unknown revision or path not in the working tree") =>
            {
                return Err(Error::Source(output));
            }
            Err(e) => return Err(e),
        };
        if hash_list.contains("unknown revision or path not in the working tree") {
            return Err(Error::Source(hash_list));
        }

        // The walk includes `current` itself; the earliest commit is the
        // last non-empty line.
        let hashes: Vec<&str> = hash_list
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if hashes.len() < revisions {
            return Err(Error::Source(format!(
                "no commit found {revisions} revisions from {current}"
            )));
        }
        hashes
            .last()
            .map(|h| h.to_string())
            .ok_or_else(|| Error::Source(format!("no commit found prior to {current}")))
    }

    /// Enumerate repository tags in version order.
    pub fn list_tags(&mut self) -> Result<Vec<String>> {
        self.validate()?;
        let dir = self.source_directory()?;
        let output = cmd_exec::run("git tag --list --sort v:refname", &dir)?;
        let tags = output
            .lines()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        debug!(?tags, "repository tags");
        Ok(tags)
    }

    /// Identify a tag `revisions` entries behind `current` in version order.
    pub fn get_previous_tag(&mut self, current: &str, revisions: usize) -> Result<String> {
        if !is_release_tag(current) {
            return Err(Error::Source(format!(
                "tag {current} is not in the expected release format"
            )));
        }
        let mut tags = self.list_tags()?;
        tags.reverse();
        previous_tag_in_list(&tags, current, revisions)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Source(format!("no tag found {revisions} revisions behind {current}"))
            })
    }

    /// How many commits the working copy lags behind its parent branch.
    pub fn get_revs_behind_parent_branch(&mut self) -> Result<u32> {
        self.validate()?;
        let dir = self.source_directory()?;
        let status = cmd_exec::run("git status", &dir)?;
        Ok(parse_revs_behind(&status))
    }

    pub fn is_up_to_date(&mut self) -> Result<bool> {
        Ok(self.get_revs_behind_parent_branch()? == 0)
    }
}

impl std::fmt::Debug for SourceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTree")
            .field("identity", &self.identity().as_str())
            .field("origin", &self.repo.source_url)
            .field("branch", &self.repo.branch)
            .field("hash", &self.repo.commit_hash)
            .field("workdir", &self.workdir.as_ref().map(|d| d.path()))
            .finish()
    }
}
