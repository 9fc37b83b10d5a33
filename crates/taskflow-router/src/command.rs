//! Command building and executable resolution for the external tool.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for external tool invocations.
///
/// The base may carry its own arguments (`"npx auggie"`); it is split with
/// shell quoting rules.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pub base: String,
    pub params: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append one flag.
    #[must_use]
    pub fn flag(mut self, flag: &str) -> Self {
        self.params.push(flag.to_string());
        self
    }

    /// Append a flag if `enabled`.
    #[must_use]
    pub fn flag_if(self, enabled: bool, flag: &str) -> Self {
        if enabled { self.flag(flag) } else { self }
    }

    /// Append a flag and its value.
    #[must_use]
    pub fn option(mut self, flag: &str, value: impl AsRef<Path>) -> Self {
        self.params.push(flag.to_string());
        self.params
            .push(value.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Split the base and append the params.
    ///
    /// # Errors
    /// Returns error if the base is unparseable or empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        parts.extend(self.params.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

/// Resolve an executable by name.
///
/// Explicit paths are used as-is when they exist; bare names go through
/// `PATH` via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return tokio::fs::metadata(path)
            .await
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|_| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_splits_base_and_appends() {
        let parts = CommandBuilder::new("npx 'my tool'")
            .flag("--print")
            .option("--instruction-file", "/tmp/a b.txt")
            .flag_if(false, "--quiet")
            .flag_if(true, "--continue")
            .build()
            .unwrap();

        assert_eq!(parts.program, "npx");
        assert_eq!(
            parts.args,
            vec!["my tool", "--print", "--instruction-file", "/tmp/a b.txt", "--continue"]
        );
    }

    #[test]
    fn test_build_rejects_bad_base() {
        assert!(matches!(
            CommandBuilder::new("").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
        assert!(matches!(
            CommandBuilder::new("tool 'unterminated").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_missing_executable() {
        assert!(resolve_executable_path("").await.is_none());
        assert!(resolve_executable_path("definitely-not-a-real-tool-xyz").await.is_none());
        assert!(resolve_executable_path("/nonexistent/bin/tool").await.is_none());
    }
}
