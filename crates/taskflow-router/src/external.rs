//! External command-line tool provider.
//!
//! Availability is probed once with `<cmd> --version`. Each invocation writes
//! the instruction to a temporary file and passes it with
//! `--instruction-file`; the file is removed whether or not the call succeeds.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::{process::Command, sync::OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    command::CommandBuilder,
    error::ProviderError,
    provider::Provider,
    task::{ProviderKind, ProviderResponse, Task, TaskOptions},
};

/// External tool configuration.
#[derive(Debug, Clone)]
pub struct ExternalToolConfig {
    /// Base command; may include leading arguments.
    pub command: String,
    /// Passed as `--rules <file>` when set.
    pub rules_path: Option<PathBuf>,
    /// Working directory for invocations.
    pub working_dir: PathBuf,
    /// Where instruction files are written.
    pub temp_dir: PathBuf,
    pub probe_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for ExternalToolConfig {
    fn default() -> Self {
        Self {
            command: "auggie".to_string(),
            rules_path: None,
            working_dir: PathBuf::from("."),
            temp_dir: std::env::temp_dir(),
            probe_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl ExternalToolConfig {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_rules(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Runs instructions through an external CLI.
#[derive(Debug)]
pub struct ExternalToolProvider {
    config: ExternalToolConfig,
    available: OnceCell<bool>,
}

impl ExternalToolProvider {
    #[must_use]
    pub fn new(config: ExternalToolConfig) -> Self {
        Self {
            config,
            available: OnceCell::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ExternalToolConfig {
        &self.config
    }

    /// Probe the tool once; later calls return the cached answer.
    pub async fn probe(&self) -> bool {
        *self
            .available
            .get_or_init(|| async { self.run_probe().await })
            .await
    }

    async fn run_probe(&self) -> bool {
        let parts = match CommandBuilder::new(&self.config.command)
            .flag("--version")
            .build()
        {
            Ok(parts) => parts,
            Err(err) => {
                warn!(command = %self.config.command, %err, "Invalid external tool command");
                return false;
            }
        };
        let Ok((program, args)) = parts.into_resolved().await else {
            debug!(command = %self.config.command, "External tool not found");
            return false;
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let Ok(child) = cmd.spawn() else {
            return false;
        };
        match tokio::time::timeout(self.config.probe_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(program = %program.display(), %version, "External tool available");
                true
            }
            Ok(Ok(output)) => {
                debug!(status = ?output.status, "External tool probe failed");
                false
            }
            Ok(Err(err)) => {
                debug!(?err, "External tool probe failed");
                false
            }
            Err(_) => {
                warn!(program = %program.display(), "Timed out probing external tool");
                false
            }
        }
    }

    /// Run one instruction and return the tool's trimmed stdout.
    ///
    /// # Errors
    /// Returns error if the tool is unavailable, cannot be spawned, exits
    /// non-zero or exceeds the call timeout.
    pub async fn run_instruction(
        &self,
        instruction: &str,
        options: &TaskOptions,
    ) -> Result<String, ProviderError> {
        if !self.probe().await {
            return Err(ProviderError::Unavailable {
                provider: ProviderKind::ExternalTool,
                reason: format!("`{}` is not installed", self.config.command),
            });
        }

        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let file = self
            .config
            .temp_dir
            .join(format!("instruction-{}.txt", Uuid::new_v4()));
        tokio::fs::write(&file, instruction).await?;

        let result = self.invoke(&file, options).await;

        if let Err(err) = tokio::fs::remove_file(&file).await {
            warn!(path = %file.display(), %err, "Failed to remove instruction file");
        }
        result
    }

    async fn invoke(&self, file: &Path, options: &TaskOptions) -> Result<String, ProviderError> {
        let mut builder = CommandBuilder::new(&self.config.command).flag("--print");
        if let Some(rules) = &self.config.rules_path {
            builder = builder.option("--rules", rules);
        }
        let (program, args) = builder
            .option("--instruction-file", file)
            .flag_if(options.quiet, "--quiet")
            .flag_if(options.continue_session, "--continue")
            .build()?
            .into_resolved()
            .await?;

        let timeout = options.timeout.unwrap_or(self.config.call_timeout);
        debug!(program = %program.display(), ?args, ?timeout, "Invoking external tool");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout(timeout))??;

        if !output.status.success() {
            return Err(ProviderError::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Provider for ExternalToolProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ExternalTool
    }

    fn is_available(&self) -> bool {
        self.available.get().copied().unwrap_or(false)
    }

    async fn execute(
        &self,
        task: &Task,
        options: &TaskOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        let instruction = task
            .instruction
            .as_deref()
            .ok_or(ProviderError::MissingInstruction)?;
        let result = self.run_instruction(instruction, options).await?;
        Ok(ProviderResponse::ok(
            ProviderKind::ExternalTool,
            json!({ "result": result }),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;
    use tokio_test::assert_ok;

    use super::*;
    use crate::task::TaskKind;

    /// Echoes the instruction file back; `--version` prints a version.
    const ECHO_TOOL: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "fake-tool 1.0.0"; exit 0; fi
for arg in "$@"; do
  if [ "$prev" = "--instruction-file" ]; then cat "$arg"; fi
  prev="$arg"
done
echo " args:$*"
"#;

    const FAILING_TOOL: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "1.0"; exit 0; fi
echo "boom" >&2
exit 3
"#;

    const SLOW_TOOL: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "1.0"; exit 0; fi
sleep 5
"#;

    fn install(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("tool.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn provider(dir: &TempDir, script: &str) -> ExternalToolProvider {
        let tool = install(dir.path(), script);
        let temp = dir.path().join("instructions");
        ExternalToolProvider::new(
            ExternalToolConfig::new(tool.to_string_lossy())
                .with_working_dir(dir.path())
                .with_temp_dir(temp),
        )
    }

    fn instruction_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join("instructions"))
            .map(Iterator::count)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_probe_missing_tool() {
        let provider =
            ExternalToolProvider::new(ExternalToolConfig::new("definitely-not-a-real-tool-xyz"));
        assert!(!provider.is_available());
        assert!(!provider.probe().await);
        assert!(!provider.is_available());

        let err = provider
            .execute(
                &Task::new(TaskKind::CodeGeneration).with_instruction("x"),
                &TaskOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_invocation_passes_instruction_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, ECHO_TOOL);
        assert!(provider.probe().await);
        assert!(provider.is_available());

        let options = TaskOptions {
            quiet: true,
            ..TaskOptions::default()
        };
        let response = assert_ok!(
            provider
                .execute(
                    &Task::new(TaskKind::CodeGeneration).with_instruction("write a parser"),
                    &options,
                )
                .await
        );

        let result = response.output["result"].as_str().unwrap();
        assert!(result.starts_with("write a parser"));
        assert!(result.contains("--print"));
        assert!(result.contains("--instruction-file"));
        assert!(result.contains("--quiet"));
        assert!(!result.contains("--continue"));
        assert_eq!(instruction_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_removes_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, FAILING_TOOL);

        let err = provider
            .run_instruction("do it", &TaskOptions::default())
            .await
            .unwrap_err();
        match err {
            ProviderError::ExitStatus { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(instruction_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, SLOW_TOOL);
        let options = TaskOptions {
            timeout: Some(Duration::from_millis(100)),
            ..TaskOptions::default()
        };

        let err = provider.run_instruction("wait", &options).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert_eq!(instruction_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_missing_instruction() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, ECHO_TOOL);
        let err = provider
            .execute(&Task::new(TaskKind::CodeGeneration), &TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingInstruction));
    }
}
