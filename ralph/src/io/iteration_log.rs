//! Product logs under `.ralph/`: the append-only session summary and one
//! Markdown transcript per iteration.
//!
//! These are user-facing artifacts, independent of `RUST_LOG` tracing.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;

use crate::core::session::now;
use crate::core::types::{InvocationMode, Sandbox};
use crate::io::process::LineSink;

fn clock() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// `.ralph/session.log`
#[derive(Debug, Clone)]
pub struct SessionLog {
    sink: LineSink,
}

impl SessionLog {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            sink: LineSink::append(path, false)?,
        })
    }

    pub fn session_started(&self, sandbox: Sandbox, mode: InvocationMode) -> Result<()> {
        self.sink.write_text(&format!(
            "\n=== Session started {} ===\nSandbox: {sandbox}\nMode: {mode}\n",
            now().to_rfc3339()
        ))
    }

    pub fn iteration_started(&self, iteration: u32) -> Result<()> {
        self.entry(&format!("Iteration {iteration} started"))
    }

    pub fn iteration_completed(&self, iteration: u32, progress: &str) -> Result<()> {
        self.entry(&format!(
            "Iteration {iteration} completed, progress: {progress}"
        ))
    }

    pub fn item_completed(&self, id: &str, title: &str) -> Result<()> {
        self.entry(&format!("Completed [{id}] {title}"))
    }

    pub fn error(&self, message: &str) -> Result<()> {
        self.entry(&format!("Error: {message}"))
    }

    pub fn interrupted(&self) -> Result<()> {
        self.entry("Interrupted")
    }

    pub fn session_ended(&self) -> Result<()> {
        self.sink
            .write_text(&format!("=== Session ended {} ===\n", now().to_rfc3339()))
    }

    fn entry(&self, message: &str) -> Result<()> {
        self.sink.write_text(&format!("[{}] {message}\n", clock()))
    }
}

/// Header facts for one iteration transcript.
#[derive(Debug, Clone)]
pub struct ConversationHeader<'a> {
    pub iteration: u32,
    pub sandbox: Sandbox,
    pub progress_before: &'a str,
    /// `[id] title` of the targeted item, when the loop chose one.
    pub target: Option<String>,
}

/// `.ralph/conversations/iteration-<n>.md`, open for the duration of one
/// agent call. Agent output is streamed into [`ConversationLog::sink`].
#[derive(Debug)]
pub struct ConversationLog {
    sink: LineSink,
}

impl ConversationLog {
    /// Create the transcript and write the header and prompt.
    pub fn begin(path: &Path, header: &ConversationHeader<'_>, echo: bool) -> Result<Self> {
        let sink = LineSink::create(path, echo)?;
        let mut text = format!(
            "# Iteration {}\n\n**Started:** {}\n**Sandbox:** {}\n**Progress before:** {}\n",
            header.iteration,
            now().to_rfc3339(),
            header.sandbox,
            header.progress_before,
        );
        if let Some(target) = &header.target {
            text.push_str(&format!("**Item:** {target}\n"));
        }
        text.push('\n');
        sink.write_text(&text)?;
        Ok(Self { sink })
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        self.sink.write_text(&format!(
            "## Prompt\n\n```\n{}\n```\n\n## Agent Output\n\n```\n",
            prompt.trim_end()
        ))
    }

    pub fn sink(&self) -> &LineSink {
        &self.sink
    }

    pub fn finish(self, progress_after: &str) -> Result<()> {
        self.sink.write_text(&format!(
            "```\n\n---\n**Ended:** {}\n**Progress after:** {progress_after}\n",
            now().to_rfc3339()
        ))
    }
}

/// Last `count` lines of a product log, oldest first.
pub fn tail_lines(path: &Path, count: usize) -> Result<Vec<String>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(count);
    Ok(lines[skip..].iter().map(|line| (*line).to_string()).collect())
}

/// Reads lines appended to a log after it was opened.
///
/// A partial trailing line is held back until its newline arrives. If the
/// file shrinks it is read again from the start.
#[derive(Debug)]
pub struct LogFollower {
    file: File,
    offset: u64,
    pending: Vec<u8>,
}

impl LogFollower {
    pub fn open_at_end(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let offset = file.seek(SeekFrom::End(0)).context("seek to end of log")?;
        Ok(Self {
            file,
            offset,
            pending: Vec::new(),
        })
    }

    /// Complete lines appended since the last poll.
    pub fn poll(&mut self) -> Result<Vec<String>> {
        let len = self.file.metadata().context("stat log")?.len();
        if len < self.offset {
            self.offset = self.file.seek(SeekFrom::Start(0)).context("rewind log")?;
            self.pending.clear();
        }
        let read = self
            .file
            .read_to_end(&mut self.pending)
            .context("read log")?;
        self.offset += read as u64;

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        Ok(String::from_utf8_lossy(&complete)
            .lines()
            .map(str::to_string)
            .collect())
    }
}
