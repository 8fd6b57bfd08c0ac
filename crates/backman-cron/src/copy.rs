//! Copy executor: runs an external recursive copy under a hard timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use backman_config::CopyToolConfig;
use backman_types::{format_duration, round_mb};

/// Default wall-clock limit for one copy.
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(3600);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

static FILES_COPIED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(\d+)\s+File\(s\)\s+copied").expect("static regex")
});

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("copy timed out after {}", format_duration(*.0))]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a copy that ran to completion (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyResult {
    /// Process exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Parsed from the program output; 0 when not parseable or on failure.
    pub files_copied: u64,
    pub stdout: String,
    pub stderr: String,
}

impl CopyResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Performs the copy of a task's source into its destination.
#[async_trait]
pub trait CopyExecutor: Send + Sync {
    async fn copy(
        &self,
        source: &Path,
        destination: &Path,
        timeout: Duration,
    ) -> Result<CopyResult, CopyError>;

    /// Size of everything under `path` in MB, rounded to 2 decimals.
    async fn folder_size_mb(&self, path: &Path) -> f64 {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || folder_size_mb(&path))
            .await
            .unwrap_or_else(|e| {
                warn!("Folder size computation failed: {e}");
                0.0
            })
    }
}

/// The external program used for copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyTool {
    /// `xcopy SRC DST /E /H /C /I /Y`
    Xcopy,
    /// `cp -R -f -v SRC/. DST` with DST created up front.
    Cp,
    /// Custom program; `{source}` / `{destination}` are substituted in `args`.
    Command { program: String, args: Vec<String> },
}

impl CopyTool {
    pub fn platform_default() -> Self {
        if cfg!(windows) { Self::Xcopy } else { Self::Cp }
    }

    pub fn from_config(config: &CopyToolConfig) -> Self {
        match config {
            CopyToolConfig::Auto => Self::platform_default(),
            CopyToolConfig::Xcopy => Self::Xcopy,
            CopyToolConfig::Cp => Self::Cp,
            CopyToolConfig::Command { program, args } => Self::Command {
                program: program.clone(),
                args: args.clone(),
            },
        }
    }

    pub fn program(&self) -> &str {
        match self {
            Self::Xcopy => "xcopy",
            Self::Cp => "cp",
            Self::Command { program, .. } => program,
        }
    }

    fn args(&self, source: &Path, destination: &Path) -> Vec<String> {
        let src = source.display().to_string();
        let dst = destination.display().to_string();
        match self {
            Self::Xcopy => [src.as_str(), dst.as_str(), "/E", "/H", "/C", "/I", "/Y"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            Self::Cp => vec![
                "-R".into(),
                "-f".into(),
                "-v".into(),
                source.join(".").display().to_string(),
                dst,
            ],
            Self::Command { args, .. } => args
                .iter()
                .map(|a| a.replace("{source}", &src).replace("{destination}", &dst))
                .collect(),
        }
    }

    /// Extract the copied-file count from the program's standard output.
    pub fn parse_files_copied(&self, stdout: &str) -> u64 {
        match self {
            Self::Cp => stdout
                .lines()
                .filter_map(|line| line.split_once(" -> ").map(|(_, target)| target))
                .map(|target| PathBuf::from(target.trim().trim_matches(['\'', '"'])))
                .filter(|target| !target.is_dir())
                .count() as u64,
            Self::Xcopy | Self::Command { .. } => FILES_COPIED_RE
                .captures(stdout)
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Copies by spawning the configured [`CopyTool`].
#[derive(Debug, Clone)]
pub struct CommandCopyExecutor {
    tool: CopyTool,
}

impl CommandCopyExecutor {
    pub fn new(tool: CopyTool) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &CopyTool {
        &self.tool
    }
}

impl Default for CommandCopyExecutor {
    fn default() -> Self {
        Self::new(CopyTool::platform_default())
    }
}

#[async_trait]
impl CopyExecutor for CommandCopyExecutor {
    async fn copy(
        &self,
        source: &Path,
        destination: &Path,
        timeout: Duration,
    ) -> Result<CopyResult, CopyError> {
        // xcopy creates the destination itself (/I); the others need it to exist.
        if self.tool != CopyTool::Xcopy {
            tokio::fs::create_dir_all(destination).await?;
        }

        let program = self.tool.program();
        let mut cmd = Command::new(program);
        cmd.args(self.tool.args(source, destination))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program, source = %source.display(), destination = %destination.display(), "Starting copy");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(CopyError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
            Err(_) => return Err(CopyError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        let files_copied = if output.status.success() {
            self.tool.parse_files_copied(&stdout)
        } else {
            0
        };

        Ok(CopyResult {
            exit_code,
            files_copied,
            stdout,
            stderr,
        })
    }
}

/// Sum of file sizes under `path` in MB, rounded to 2 decimals.
///
/// Entries that cannot be read or stat'ed are skipped.
pub fn folder_size_mb(path: &Path) -> f64 {
    let bytes: u64 = WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    round_mb(bytes as f64 / BYTES_PER_MB)
}
