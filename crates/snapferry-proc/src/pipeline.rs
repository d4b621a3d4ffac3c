//! Subprocess pipeline stages
//!
//! Children run in their own process group so an interrupt delivered to
//! the parent is not auto-forwarded; callers terminate children
//! explicitly (or rely on kill-on-drop) once they have settled their own
//! cleanup. Stderr of every stage is relayed through tracing until the
//! first real failure, after which broken-pipe noise from downstream
//! stages is dropped.

use crate::{ProcError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Shared flag marking that some pipeline stage has failed.
///
/// Once tripped, stderr forwarding goes quiet for every stage sharing
/// the flag, so one real error does not cascade into pages of
/// "broken pipe" from the stages downstream of it.
#[derive(Debug, Clone, Default)]
pub struct FailureFlag(Arc<AtomicBool>);

impl FailureFlag {
    /// Create an untripped flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the pipeline as failed
    pub fn trip(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Check whether any stage has failed
    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An external tool invocation, not yet spawned
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl Tool {
    /// Describe a tool invocation
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    /// Run the tool with the given working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.name);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        // Detached group: SIGINT at the parent must not reach children
        // before the parent has aborted its multipart upload.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawn as a pipeline source: stdout piped, stdin closed
    pub fn spawn_source(self, flag: &FailureFlag) -> Result<ToolChild> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.spawn_inner(cmd, flag)
    }

    /// Spawn as a pipeline filter: stdin and stdout both piped
    pub fn spawn_filter(self, flag: &FailureFlag) -> Result<ToolChild> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.spawn_inner(cmd, flag)
    }

    /// Spawn as a pipeline sink: stdin piped, stdout dropped
    pub fn spawn_sink(self, flag: &FailureFlag) -> Result<ToolChild> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        self.spawn_inner(cmd, flag)
    }

    fn spawn_inner(self, mut cmd: Command, flag: &FailureFlag) -> Result<ToolChild> {
        let mut child = cmd.spawn().map_err(|source| ProcError::Spawn {
            tool: self.name.clone(),
            source,
        })?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(self.name.clone(), stderr, flag.clone());
        }
        Ok(ToolChild {
            name: self.name,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            flag: flag.clone(),
        })
    }
}

/// A spawned pipeline stage
#[derive(Debug)]
pub struct ToolChild {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    flag: FailureFlag,
}

impl ToolChild {
    /// Tool name, for error reporting
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the write end of the child's stdin.
    ///
    /// Dropping the returned handle closes the pipe, which is how a
    /// filter stage learns its input is complete.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the read end of the child's stdout
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Request termination without waiting
    pub fn start_kill(&mut self) {
        self.flag.trip();
        let _ = self.child.start_kill();
    }

    /// Wait for exit and settle the stage.
    ///
    /// Closes stdin first (if still held) so a filter stage is not left
    /// waiting on input forever. A non-zero exit trips the shared
    /// failure flag and maps to [`ProcError::Exit`].
    pub async fn wait(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            self.flag.trip();
            Err(ProcError::Exit {
                tool: self.name.clone(),
                status,
                detail: String::new(),
            })
        }
    }
}

/// Relay a stage's stderr through tracing, line by line, until the
/// shared failure flag trips.
fn forward_stderr(name: String, stderr: ChildStderr, flag: FailureFlag) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if flag.is_tripped() {
                continue;
            }
            tracing::warn!(tool = %name, "{line}");
        }
    });
}

/// Run a short-lived tool to completion and return its stdout.
///
/// For the helpers (lsblk, du, mount, umount, sort) where streaming is
/// not needed. Non-zero exit carries the tool's stderr in the error.
pub async fn run_tool(
    name: &str,
    args: impl IntoIterator<Item = impl Into<String>>,
) -> Result<String> {
    run_tool_with_env(name, args, &[]).await
}

/// [`run_tool`] with extra environment variables for the child
pub async fn run_tool_with_env(
    name: &str,
    args: impl IntoIterator<Item = impl Into<String>>,
    env: &[(&str, &str)],
) -> Result<String> {
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let mut cmd = Command::new(name);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.to_string(), v.to_string())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);
    let output = cmd.output().await.map_err(|source| ProcError::Spawn {
        tool: name.to_string(),
        source,
    })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = match stderr.trim() {
            "" => String::new(),
            s => format!(": {s}"),
        };
        Err(ProcError::Exit {
            tool: name.to_string(),
            status: output.status,
            detail,
        })
    }
}

/// Verify every required tool is reachable on PATH.
///
/// Missing tools are aggregated into one error so the operator sees the
/// full install list at once.
pub async fn preflight(tools: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    for tool in tools {
        let probe = Command::new(tool)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if probe.is_err() {
            missing.push(*tool);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProcError::MissingTools(missing.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_failure_flag() {
        let flag = FailureFlag::new();
        assert!(!flag.is_tripped());
        flag.trip();
        assert!(flag.is_tripped());
        // Clones observe the same state
        let other = flag.clone();
        assert!(other.is_tripped());
    }

    #[tokio::test]
    async fn test_source_stage_streams_stdout() {
        let flag = FailureFlag::new();
        let mut child = Tool::new("echo", ["hello"]).spawn_source(&flag).unwrap();
        let mut out = String::new();
        child
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        child.wait().await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_filter_stage_round_trip() {
        let flag = FailureFlag::new();
        let mut child = Tool::new("cat", Vec::<String>::new())
            .spawn_filter(&flag)
            .unwrap();
        let mut stdin = child.take_stdin().unwrap();
        let mut stdout = child.take_stdout().unwrap();
        stdin.write_all(b"pipeline").await.unwrap();
        drop(stdin);
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        child.wait().await.unwrap();
        assert_eq!(out, b"pipeline");
    }

    #[tokio::test]
    async fn test_nonzero_exit_trips_flag() {
        let flag = FailureFlag::new();
        let mut child = Tool::new("false", Vec::<String>::new())
            .spawn_source(&flag)
            .unwrap();
        let err = child.wait().await.unwrap_err();
        assert!(matches!(err, ProcError::Exit { .. }));
        assert!(flag.is_tripped());
    }

    #[tokio::test]
    async fn test_run_tool_captures_stdout() {
        let out = run_tool("echo", ["one", "two"]).await.unwrap();
        assert_eq!(out.trim(), "one two");
    }

    #[tokio::test]
    async fn test_run_tool_reports_missing_binary() {
        let err = run_tool("snapferry-no-such-tool", Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_preflight_flags_missing_tools() {
        let err = preflight(&["sh", "snapferry-no-such-tool"])
            .await
            .unwrap_err();
        match err {
            ProcError::MissingTools(list) => assert_eq!(list, "snapferry-no-such-tool"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
