use std::time::Duration;

/// Options for one execution run.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Shell used to run commands, invoked as `<shell> -c <command>`.
    pub shell: String,

    /// Maximum number of simultaneously running commands.
    pub parallelism: usize,

    /// Interval between the interrupt signal and the forced kill when a
    /// run is cancelled. Zero escalates immediately.
    pub grace: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            parallelism: 1,
            grace: Duration::ZERO,
        }
    }
}

impl ExecConfig {
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}
