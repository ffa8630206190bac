//! Helpers for executing subprocesses quietly; output is captured
//! and only surfaced on failure.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Extension trait for [`std::process::Command`].
pub trait CommandRunExt {
    /// Force the C locale so that the tool output we parse is stable.
    fn lang_c(&mut self) -> &mut Self;

    /// Execute the child process; an unsuccessful exit status is an
    /// error carrying the captured stderr.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// Execute the child process, feeding `input` to its stdin.
    fn run_with_stdin(&mut self, input: &str) -> Result<()>;
}

fn describe(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

impl CommandRunExt for Command {
    fn lang_c(&mut self) -> &mut Self {
        self.env("LANG", "C").env("LC_ALL", "C")
    }

    fn run(&mut self) -> Result<()> {
        let name = describe(self);
        tracing::debug!("exec: {self:?}");
        let output = self
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Spawning {name}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{name} failed: {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let name = describe(self);
        tracing::debug!("exec: {self:?}");
        let output = self
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Spawning {name}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{name} failed: {}: {}", output.status, stderr.trim());
        }
        String::from_utf8(output.stdout).with_context(|| format!("Parsing {name} output"))
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = describe(self);
        let stdout = self.run_get_string()?;
        serde_json::from_str(&stdout).with_context(|| format!("Parsing {name} JSON output"))
    }

    fn run_with_stdin(&mut self, input: &str) -> Result<()> {
        let name = describe(self);
        tracing::debug!("exec: {self:?}");
        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {name}"))?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(input.as_bytes())
            .with_context(|| format!("Writing to {name} stdin"))?;
        let output = child
            .wait_with_output()
            .with_context(|| format!("Executing {name}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{name} failed: {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());
    }

    #[test]
    fn test_run_get_string() {
        let v = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(v.trim(), "hello");
    }

    #[test]
    fn test_run_with_stdin() {
        Command::new("cat").run_with_stdin("some input\n").unwrap();
    }
}
