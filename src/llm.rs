//! The LLM capability boundary.
//!
//! The loop controller and the chat/ask orchestrators depend on
//! [`LlmInvoker`]: given a prompt, return the model's response within a
//! deadline. Implementations cover subprocess invocation (prompt on stdin
//! or via temp file) and a scripted mock for tests; replay mode bypasses
//! invocation entirely.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{MemctlError, Result};

/// How the prompt reaches the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Pipe the prompt to stdin.
    Stdin,
    /// Write the prompt to a temp file and append its path to the argv.
    File,
}

impl std::str::FromStr for PromptMode {
    type Err = MemctlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdin" => Ok(Self::Stdin),
            "file" => Ok(Self::File),
            _ => Err(MemctlError::Validation(format!(
                "invalid llm mode {s:?}: expected stdin|file"
            ))),
        }
    }
}

/// Capability interface for invoking an external LLM.
pub trait LlmInvoker {
    /// Send a prompt, return the model's raw output within `timeout`.
    fn invoke(&mut self, prompt: &str, timeout: Duration) -> Result<String>;
}

/// Invoke an LLM command as a subprocess (e.g. `claude -p`,
/// `ollama run mistral`).
pub struct SubprocessInvoker {
    argv: Vec<String>,
    mode: PromptMode,
}

impl SubprocessInvoker {
    pub fn new(cmd: &str, mode: PromptMode) -> Result<Self> {
        let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(MemctlError::Validation("empty LLM command".into()));
        }
        Ok(Self { argv, mode })
    }
}

impl LlmInvoker for SubprocessInvoker {
    fn invoke(&mut self, prompt: &str, timeout: Duration) -> Result<String> {
        let mut argv = self.argv.clone();

        // Keep the temp file alive until the child exits.
        let mut _prompt_file = None;
        if self.mode == PromptMode::File {
            let mut file = tempfile::Builder::new()
                .prefix("memctl_prompt_")
                .suffix(".txt")
                .tempfile()?;
            file.write_all(prompt.as_bytes())?;
            file.flush()?;
            argv.push(file.path().to_string_lossy().to_string());
            _prompt_file = Some(file);
        }

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(if self.mode == PromptMode::Stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    MemctlError::Validation(format!("LLM command not found: {:?}", argv[0]))
                }
                _ => MemctlError::Io(e),
            })?;

        if self.mode == PromptMode::Stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes())?;
            }
        }

        // Poll with a deadline; kill on expiry.
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    let output = child.wait_with_output()?;
                    if !status.success() {
                        let stderr_preview: String = String::from_utf8_lossy(&output.stderr)
                            .trim()
                            .chars()
                            .take(200)
                            .collect();
                        return Err(MemctlError::Validation(format!(
                            "LLM command failed (exit {}): {stderr_preview}",
                            status.code().unwrap_or(-1)
                        )));
                    }
                    return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(MemctlError::Transient(format!(
                            "LLM command timed out after {}s",
                            timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }
}

/// Scripted invoker for tests: returns canned answers in sequence and
/// records the prompts it was given.
#[derive(Default)]
pub struct MockInvoker {
    responses: Vec<String>,
    cursor: usize,
    pub prompts: Vec<String>,
}

impl MockInvoker {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: 0,
            prompts: Vec::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.cursor
    }
}

impl LlmInvoker for MockInvoker {
    fn invoke(&mut self, prompt: &str, _timeout: Duration) -> Result<String> {
        self.prompts.push(prompt.to_string());
        let response = self
            .responses
            .get(self.cursor)
            .cloned()
            .ok_or_else(|| MemctlError::Validation("mock invoker exhausted".into()))?;
        self.cursor += 1;
        Ok(response)
    }
}
