//! Worker command construction.
//!
//! The runner delegates turning a batch's resolved argv into a concrete
//! process invocation to a [`CommandBuilder`]. The default implementation
//! carries all of its configuration explicitly — program path, leading
//! arguments, environment overrides, working directory — so nothing is read
//! from ambient process-wide state. No shell is involved: arguments are
//! passed as discrete argv entries and need no escaping.

use std::path::PathBuf;

use tokio::process::Command;

/// Collaborator producing the concrete invocation for one batch.
pub trait CommandBuilder: Send + Sync {
    /// Build the process command for a batch, given the batch's resolved
    /// argv entries (markers already substituted).
    fn build(&self, batch_args: &[String]) -> Command;
}

/// Default command builder: a fixed program with optional leading arguments,
/// environment overrides and working directory, followed by the per-batch
/// argv.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: PathBuf,
    leading_args: Vec<String>,
    envs: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl ProcessCommand {
    /// A builder invoking `program` with no extra configuration.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
        }
    }

    /// Append a static argument placed before the per-batch argv, e.g. a
    /// subcommand name.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// Append several static leading arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for every spawned worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set the working directory for every spawned worker.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The configured program path.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl CommandBuilder for ProcessCommand {
    fn build(&self, batch_args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args).args(batch_args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn argv(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn batch_args_follow_leading_args() {
        let builder = ProcessCommand::new("importer").arg("import").arg("--all");
        let cmd = builder.build(&["--offset".to_string(), "500".to_string()]);
        assert_eq!(cmd.as_std().get_program(), OsStr::new("importer"));
        assert_eq!(argv(&cmd), vec!["import", "--all", "--offset", "500"]);
    }

    #[test]
    fn env_overrides_are_applied() {
        let builder = ProcessCommand::new("worker").env("APP_CONTEXT", "Production");
        let cmd = builder.build(&[]);
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(
            envs.iter()
                .any(|(k, v)| *k == OsStr::new("APP_CONTEXT") && *v == Some(OsStr::new("Production")))
        );
    }

    #[test]
    fn working_directory_is_applied() {
        let builder = ProcessCommand::new("worker").current_dir("/tmp");
        let cmd = builder.build(&[]);
        assert_eq!(
            cmd.as_std().get_current_dir(),
            Some(std::path::Path::new("/tmp"))
        );
    }

    #[test]
    fn bare_builder_passes_batch_args_through() {
        let builder = ProcessCommand::new("/bin/true");
        let cmd = builder.build(&["a b".to_string()]);
        // A single argv entry stays one entry, spaces and all.
        assert_eq!(argv(&cmd), vec!["a b"]);
    }
}
