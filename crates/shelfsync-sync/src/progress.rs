//! Human-readable progress lines for the operator shell.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use shelfsync_core::Locale;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub at: DateTime<Local>,
    pub locale: Locale,
    pub level: LineLevel,
    pub message: String,
}

impl ProgressLine {
    pub fn new(locale: Locale, level: LineLevel, message: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            locale,
            level,
            message: message.into(),
        }
    }
}

/// `[dd/MM/yyyy HH:mm:ss] (IT) message`
impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] ({}) {}",
            self.at.format("%d/%m/%Y %H:%M:%S"),
            self.locale,
            self.message
        )
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, line: &ProgressLine);

    fn info(&self, locale: Locale, message: &str) {
        self.emit(&ProgressLine::new(locale, LineLevel::Info, message));
    }

    fn warn(&self, locale: Locale, message: &str) {
        self.emit(&ProgressLine::new(locale, LineLevel::Warn, message));
    }

    fn error(&self, locale: Locale, message: &str) {
        self.emit(&ProgressLine::new(locale, LineLevel::Error, message));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, line: &ProgressLine) {
        let locale = line.locale.code();
        match line.level {
            LineLevel::Info => info!(locale, "{}", line.message),
            LineLevel::Warn => warn!(locale, "{}", line.message),
            LineLevel::Error => error!(locale, "{}", line.message),
        }
    }
}

/// Append-only durability trail, with the lines of this process kept for display.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
    buffer: Mutex<Vec<String>>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffer(&self) -> Vec<String> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Clears the display buffer; the file keeps everything.
    pub fn clear(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }
    }
}

impl ProgressSink for FileSink {
    fn emit(&self, line: &ProgressLine) {
        let rendered = line.to_string();
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{rendered}") {
                    warn!(path = %self.path.display(), error = %err, "writing progress line failed");
                }
            }
            Err(_) => warn!(path = %self.path.display(), "progress file lock poisoned"),
        }
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push(rendered);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<ProgressLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<ProgressLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines().into_iter().map(|l| l.message).collect()
    }

    pub fn count_matching(&self, level: LineLevel, needle: &str) -> usize {
        self.lines()
            .iter()
            .filter(|l| l.level == level && l.message.contains(needle))
            .count()
    }
}

impl ProgressSink for MemorySink {
    fn emit(&self, line: &ProgressLine) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.clone());
        }
    }
}

#[derive(Default, Clone)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressSink for TeeSink {
    fn emit(&self, line: &ProgressLine) {
        for sink in &self.sinks {
            sink.emit(line);
        }
    }
}
