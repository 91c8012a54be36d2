use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;

/// A command that could not be started or exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("{} {detail}", String::from_utf8_lossy(.output))]
pub struct CommandError {
    /// Combined stdout and stderr, empty if the shell never started.
    pub output: Vec<u8>,
    pub detail: String,
}

/// The first failing command of a synchronous run.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    /// Position of the failed command in the sequence.
    pub index: usize,
    /// Output of the commands that succeeded before it.
    pub output: Vec<u8>,
    pub error: CommandError,
}

/// Fills the positional `%s` markers of `template` with `values`, in order.
///
/// `%%` is a literal `%`. Markers without a value stay `%s`, surplus values are dropped.
/// The values are inserted as they are: nothing is escaped for the shell.
pub fn substitute(template: &str, values: &[String]) -> String {
    let mut command = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            command.push(c);
            continue;
        }
        match chars.peek() {
            Some('s') => {
                chars.next();
                match values.next() {
                    Some(value) => command.push_str(value),
                    None => command.push_str("%s"),
                }
            }
            Some('%') => {
                chars.next();
                command.push('%');
            }
            _ => command.push('%'),
        }
    }
    command
}

fn shell(command: &str) -> Command {
    #[cfg(unix)]
    let shell = {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command);
        shell
    };
    #[cfg(windows)]
    let shell = {
        // cmd.exe does its own parsing, so the line is passed unquoted.
        let mut shell = Command::new("cmd");
        shell.arg("/C").raw_arg(command);
        shell
    };
    let mut shell = shell;
    shell.stdin(Stdio::null());
    shell
}

/// Runs a single command line through the shell and waits for it.
pub async fn run(id: u64, command: &str) -> Result<Vec<u8>, CommandError> {
    log::info!(id, command; "running");
    let start = Instant::now();
    let result = shell(command).output().await;
    let time_taken = start.elapsed();

    match result {
        Ok(out) => {
            log::debug!(id; "Status: {} after {time_taken:?}", out.status);
            log::debug!(id; "Stdout: {}", String::from_utf8_lossy(&out.stdout).trim());
            log::debug!(id; "Stderr: {}", String::from_utf8_lossy(&out.stderr).trim());
            let mut output = out.stdout;
            output.extend_from_slice(&out.stderr);
            if out.status.success() {
                Ok(output)
            } else {
                Err(CommandError {
                    output,
                    detail: out.status.to_string(),
                })
            }
        }
        Err(e) => {
            log::info!(id; "Failed: {e:?}");
            Err(CommandError {
                output: Vec::new(),
                detail: e.to_string(),
            })
        }
    }
}

/// Runs the filled templates one after another, stopping at the first failure.
pub async fn execute(
    id: u64,
    commands: &[String],
    values: &[String],
) -> Result<Vec<u8>, ExecutionFailure> {
    let mut output = Vec::new();
    for (index, template) in commands.iter().enumerate() {
        match run(id, &substitute(template, values)).await {
            Ok(out) => output.extend(out),
            Err(error) => {
                return Err(ExecutionFailure {
                    index,
                    output,
                    error,
                })
            }
        }
    }
    Ok(output)
}

/// Runs [`execute`] on a detached task.
///
/// Nobody can wait for the result, failures only show up in the log.
/// The task is not tied to the request or the serving generation and survives reloads.
pub fn dispatch(id: u64, commands: Vec<String>, values: Vec<String>) {
    tokio::spawn(async move {
        match execute(id, &commands, &values).await {
            Ok(output) => {
                log::info!(id, bytes = output.len(); "detached commands finished");
            }
            Err(failure) => {
                log::warn!(id, index = failure.index; "detached command failed: {failure}");
            }
        }
    });
}
