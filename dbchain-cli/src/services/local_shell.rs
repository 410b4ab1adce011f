//! Commands run on this host through `sh -c`.

use dbchain_core::ports::ExecutionContext;
use dbchain_core::{BackupError, Result};
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

fn spawn(command: &str, stdin: Stdio, stdout: Stdio) -> Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackupError::Command(format!("failed to start shell: {e}")))
}

/// Drain stderr on its own thread so a chatty tool cannot block on a full pipe.
fn collect_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        })
    })
}

fn finish(status: ExitStatus, stderr: Option<JoinHandle<String>>) -> Result<()> {
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    if status.success() {
        if !stderr.trim().is_empty() {
            tracing::debug!(stderr = %stderr.trim(), "Command wrote to stderr");
        }
        return Ok(());
    }
    Err(BackupError::Command(format!("{status}: {}", stderr.trim())))
}

impl ExecutionContext for LocalShell {
    fn exec_streaming(&self, command: &str, stdout: &mut dyn Write) -> Result<u64> {
        let mut child = spawn(command, Stdio::null(), Stdio::piped())?;
        let stderr = collect_stderr(&mut child);

        let copied = match child.stdout.take() {
            Some(mut out) => io::copy(&mut out, stdout),
            None => Ok(0),
        };
        let status = child.wait()?;
        finish(status, stderr)?;
        Ok(copied?)
    }

    fn exec_with_input(&self, command: &str, stdin: &mut dyn Read) -> Result<()> {
        let mut child = spawn(command, Stdio::piped(), Stdio::null())?;
        let stderr = collect_stderr(&mut child);

        let fed = match child.stdin.take() {
            // Dropping the handle closes the pipe.
            Some(mut input) => io::copy(stdin, &mut input).map(|_| ()),
            None => Ok(()),
        };
        let status = child.wait()?;
        // A failing exit status explains a broken pipe better than the pipe error.
        finish(status, stderr)?;
        Ok(fed?)
    }
}
