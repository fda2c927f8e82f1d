//! Agent executable discovery.
//!
//! Selection order, first match wins:
//!
//! | Step | Trigger | Result |
//! |------|---------|--------|
//! | 1 | `cli.path` or `CLAUDE_CLI_PATH` | that path, must be executable |
//! | 2 | `cli.prefer = "bundled"` or `CLAUDE_USE_BUNDLED=1` | bundled install |
//! | 3 | `cli.prefer = "global"` or `CLAUDE_USE_GLOBAL=1` | `PATH` install |
//! | 4 | both present | the newer of the two |
//! | 5 | only one present | that one |
//!
//! A `PATH` candidate is accepted only if `--version` mentions Claude or
//! Anthropic. The result is cached until [`CliDiscovery::invalidate`].

use std::cmp::Ordering;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{CliConfig, CliPreference};
use crate::{env, AppError, Result};

/// Explicit executable override.
pub const ENV_CLI_PATH: &str = "CLAUDE_CLI_PATH";
/// Force the bundled installation when set to `1`.
pub const ENV_USE_BUNDLED: &str = "CLAUDE_USE_BUNDLED";
/// Force the `PATH` installation when set to `1`.
pub const ENV_USE_GLOBAL: &str = "CLAUDE_USE_GLOBAL";

/// Command names searched on `PATH`, in order.
pub const GLOBAL_COMMANDS: [&str; 2] = ["claude", "anthropic"];
/// Version assumed for the bundled installation.
pub const DEFAULT_BUNDLED_VERSION: &str = "1.0.0";
/// Placeholder for an unparseable version; sorts below everything.
pub const UNKNOWN_VERSION: &str = "unknown";

const VERSION_PATTERN: &str = r"\d+(?:\.\d+)+";
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where an installation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliSource {
    /// Explicit override.
    Custom,
    /// Bundled installation.
    Bundled,
    /// Found on `PATH`.
    Global,
}

impl Display for CliSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Custom => "custom",
            Self::Bundled => "bundled",
            Self::Global => "global",
        })
    }
}

/// A resolved agent executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliInstallation {
    /// Executable path.
    pub path: PathBuf,
    /// Parsed version, or [`UNKNOWN_VERSION`].
    pub version: String,
    /// Discovery step that produced it.
    pub source: CliSource,
}

/// Cached executable lookup. Construct once and share.
#[derive(Debug)]
pub struct CliDiscovery {
    config: CliConfig,
    search_path: Option<OsString>,
    cached: Mutex<Option<CliInstallation>>,
}

impl CliDiscovery {
    /// Create from the `[cli]` config section.
    #[must_use]
    pub fn new(config: CliConfig) -> Self {
        Self {
            config,
            search_path: None,
            cached: Mutex::new(None),
        }
    }

    /// Search `path` instead of this process's `PATH`.
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Resolve the executable, using the cache when warm.
    ///
    /// # Errors
    ///
    /// [`AppError::Discovery`] if no usable installation exists.
    pub async fn resolve(&self) -> Result<CliInstallation> {
        if let Some(hit) = self.lock().clone() {
            return Ok(hit);
        }
        let found = self.discover().await?;
        info!(
            path = %found.path.display(),
            version = found.version.as_str(),
            source = %found.source,
            "agent CLI resolved"
        );
        *self.lock() = Some(found.clone());
        Ok(found)
    }

    /// Cached result, if any.
    #[must_use]
    pub fn cached(&self) -> Option<CliInstallation> {
        self.lock().clone()
    }

    /// Drop the cached result; the next [`resolve`](Self::resolve)
    /// searches again.
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    async fn discover(&self) -> Result<CliInstallation> {
        if let Some(path) = self.explicit_path() {
            if !is_executable(&path) {
                return Err(AppError::Discovery(format!(
                    "configured agent CLI is not executable: {}",
                    path.display()
                )));
            }
            let version = probe(&path)
                .await
                .map_or_else(|| UNKNOWN_VERSION.to_owned(), |out| parse_version(&out));
            return Ok(CliInstallation {
                path,
                version,
                source: CliSource::Custom,
            });
        }

        if self.config.prefer == CliPreference::Bundled || env_flag(ENV_USE_BUNDLED) {
            return self.bundled().ok_or_else(|| {
                AppError::Discovery("bundled agent CLI requested but not found".into())
            });
        }

        if self.config.prefer == CliPreference::Global || env_flag(ENV_USE_GLOBAL) {
            return self.global().await.ok_or_else(|| {
                AppError::Discovery("global agent CLI requested but not found in PATH".into())
            });
        }

        match (self.global().await, self.bundled()) {
            (Some(global), Some(bundled))
                if global.version != UNKNOWN_VERSION
                    && compare_versions(&global.version, &bundled.version) == Ordering::Less =>
            {
                debug!(
                    bundled = bundled.version.as_str(),
                    global = global.version.as_str(),
                    "bundled agent CLI is newer"
                );
                Ok(bundled)
            }
            (Some(global), _) => Ok(global),
            (None, Some(bundled)) => Ok(bundled),
            (None, None) => Err(AppError::Discovery(
                "no agent CLI installation found".into(),
            )),
        }
    }

    fn explicit_path(&self) -> Option<PathBuf> {
        self.config.path.clone().or_else(|| {
            std::env::var_os(ENV_CLI_PATH)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }

    fn bundled(&self) -> Option<CliInstallation> {
        let path = self
            .config
            .bundled_path
            .clone()
            .or_else(default_bundled_path)?;
        if !is_executable(&path) {
            return None;
        }
        Some(CliInstallation {
            path,
            version: self
                .config
                .bundled_version
                .clone()
                .unwrap_or_else(|| DEFAULT_BUNDLED_VERSION.to_owned()),
            source: CliSource::Bundled,
        })
    }

    async fn global(&self) -> Option<CliInstallation> {
        for name in GLOBAL_COMMANDS {
            let found = match &self.search_path {
                Some(paths) => {
                    let cwd = std::env::current_dir().ok()?;
                    which::which_in(name, Some(paths), cwd)
                }
                None => which::which(name),
            };
            let Ok(found) = found else {
                continue;
            };
            let path = found.canonicalize().unwrap_or(found);

            let Some(output) = probe(&path).await else {
                debug!(path = %path.display(), "version probe failed, skipping");
                continue;
            };
            if !(output.contains("Claude") || output.contains("Anthropic")) {
                debug!(path = %path.display(), "not an agent CLI, skipping");
                continue;
            }
            return Some(CliInstallation {
                path,
                version: parse_version(&output),
                source: CliSource::Global,
            });
        }
        None
    }

    fn lock(&self) -> MutexGuard<'_, Option<CliInstallation>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Extract the first dotted numeric run (`1.0.42` from `1.0.42 (Claude Code)`).
#[must_use]
pub fn parse_version(output: &str) -> String {
    let Ok(pattern) = Regex::new(VERSION_PATTERN) else {
        return UNKNOWN_VERSION.to_owned();
    };
    pattern
        .find(output)
        .map_or_else(|| UNKNOWN_VERSION.to_owned(), |m| m.as_str().to_owned())
}

/// Compare dotted versions numerically; [`UNKNOWN_VERSION`] sorts lowest.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a == UNKNOWN_VERSION, b == UNKNOWN_VERSION) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }

    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (left, right) = (parts(a), parts(b));
    let width = left.len().max(right.len());
    for i in 0..width {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Platform bundled-install location.
#[must_use]
pub fn default_bundled_path() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        Some(PathBuf::from("/Applications/Claude.app/Contents/MacOS/claude"))
    } else if cfg!(target_os = "linux") {
        Some(PathBuf::from("/opt/claude-code/dist/claude"))
    } else if cfg!(windows) {
        Some(PathBuf::from(r"C:\Program Files\Claude\claude.exe"))
    } else {
        None
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "1")
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Run `<path> --version` with a sanitized environment; combined output on
/// success.
async fn probe(path: &Path) -> Option<String> {
    let mut cmd = Command::new(path);
    cmd.arg("--version")
        .env_clear()
        .envs(env::from_process())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_PROBE_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Some(text)
}
