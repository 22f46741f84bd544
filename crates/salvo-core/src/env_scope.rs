//! Scoped mutation of the process environment.
//!
//! Every external invocation of a benchmark strategy runs inside an
//! [`EnvScope`]: a guard that installs the variables declared by the job
//! control, removes host variables known to confuse nested build tools, and
//! restores everything on drop. All process-wide environment mutation in
//! this crate goes through a scope; nothing else touches it.
//!
//! Scopes are single-threaded and not re-entrant.

use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::constants::POISON_VARS;
use crate::error::{Error, Result};
use crate::job_control::Environment;

/// Guard holding the original values of every variable a scope touched.
/// Dropping the guard restores them, on success and failure paths alike.
pub struct EnvScope {
    saved: Vec<(String, Option<String>)>,
}

impl EnvScope {
    /// Install the environment block, failing before any mutation when the
    /// IP family is unspecified.
    pub fn enter(environment: &Environment) -> Result<Self> {
        let Some(ip_family) = environment.ip_family else {
            return Err(Error::Config(
                "an IP family must be specified in the environment".to_string(),
            ));
        };

        let mut scope = Self { saved: Vec::new() };
        for name in POISON_VARS {
            scope.remove(name);
        }
        scope.export("IP_FAMILY", ip_family.as_env_value());
        if let Some(path) = &environment.proxy_path {
            scope.export_path("PROXY_PATH", path);
        }
        for (key, value) in &environment.variables {
            scope.export(key, value);
        }
        debug!(exported = scope.saved.len(), "entered environment scope");
        Ok(scope)
    }

    /// Export an additional variable inside the scope; restored on drop like
    /// the rest. Strategies use this for per-run image names.
    pub fn export(&mut self, key: &str, value: &str) {
        self.saved.push((key.to_string(), std::env::var(key).ok()));
        std::env::set_var(key, value);
    }

    pub fn export_path(&mut self, key: &str, path: &Path) {
        self.export(key, &path.to_string_lossy());
    }

    fn remove(&mut self, key: &str) {
        self.saved.push((key.to_string(), std::env::var(key).ok()));
        std::env::remove_var(key);
    }
}

// Saved values can hold credentials from the host environment; show only
// which keys the scope touched.
impl fmt::Debug for EnvScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvScope")
            .field("touched", &self.saved.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        // Reverse order so a key touched twice ends at its pre-scope value.
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
        debug!("restored environment scope");
    }
}
