//! Progress reporting
//!
//! The flashing tool reports progress as text, redrawing a single line with
//! carriage returns. [ProgressEvent::parse] extracts structured progress from
//! each line and [ConsoleView] maintains the lines a user should see, with
//! in-place progress updates collapsed into a single line.

use std::sync::LazyLock;

use regex::Regex;

use crate::tool::OutputLine;

// `42.1% 1,024/2,048 bytes`
static RE_BYTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}(?:\.\d+)?)%\s*([0-9,]+)/([0-9,]+)\s*bytes").unwrap()
});
// `Writing at 0x00010000... (42 %)`
static RE_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*(\d{1,3}(?:\.\d+)?)\s*%\s*\)").unwrap());
static RE_ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").unwrap());

const COMPLETION_MARKERS: &[&str] = &["100.0%", "Flash complete"];

/// Callbacks for reporting the progress of a download
pub trait DownloadCallbacks {
    /// Bytes downloaded so far, only reported when the total size is known
    fn progress(&mut self, done: u64, total: u64);
    /// Human-readable stage or failure message
    fn status(&mut self, message: &str);
    /// Extraction has begun; it has no byte-level progress
    fn extract_start(&mut self);
}

/// Structured interpretation of a single line of tool output
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Percentage together with the byte counts
    Bytes {
        percent: f64,
        done: u64,
        total: u64,
        text: String,
    },
    /// Percentage without byte counts
    Percent { percent: f64, text: String },
    /// The operation finished
    Complete { text: String },
    /// Anything else
    Line { text: String },
}

impl ProgressEvent {
    /// Interpret a line of tool output
    pub fn parse(text: &str) -> Self {
        let text = strip_ansi(text).trim().to_owned();

        if let Some(caps) = RE_BYTES.captures(&text) {
            let percent = caps[1].parse::<f64>().unwrap_or_default();
            let done = parse_count(&caps[2]);
            let total = parse_count(&caps[3]);

            return match (done, total) {
                (Some(done), Some(total)) => ProgressEvent::Bytes {
                    percent,
                    done,
                    total,
                    text,
                },
                _ => ProgressEvent::Percent { percent, text },
            };
        }

        if COMPLETION_MARKERS.iter().any(|marker| text.contains(marker)) {
            return ProgressEvent::Complete { text };
        }

        if let Some(caps) = RE_PERCENT.captures(&text) {
            if let Ok(percent) = caps[1].parse::<f64>() {
                return ProgressEvent::Percent { percent, text };
            }
        }

        ProgressEvent::Line { text }
    }

    /// The cleaned-up text of the line
    pub fn text(&self) -> &str {
        match self {
            ProgressEvent::Bytes { text, .. }
            | ProgressEvent::Percent { text, .. }
            | ProgressEvent::Complete { text }
            | ProgressEvent::Line { text } => text,
        }
    }

    /// Progress in percent, if the line reports any
    pub fn percent(&self) -> Option<f64> {
        match self {
            ProgressEvent::Bytes { percent, .. } | ProgressEvent::Percent { percent, .. } => {
                Some(percent.clamp(0.0, 100.0))
            }
            ProgressEvent::Complete { .. } => Some(100.0),
            ProgressEvent::Line { .. } => None,
        }
    }

    /// Whether the line is an intermediate progress report
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Bytes { .. } | ProgressEvent::Percent { .. }
        )
    }
}

fn parse_count(digits: &str) -> Option<u64> {
    digits.replace(',', "").parse().ok()
}

fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    RE_ANSI.replace_all(text, "")
}

/// The lines of tool output as they should be displayed
///
/// Progress lines are redrawn in place rather than appended, until a
/// regular line arrives.
#[derive(Debug, Default, Clone)]
pub struct ConsoleView {
    lines: Vec<String>,
    tracking_progress: bool,
}

impl ConsoleView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and display a line, returning the progress it reported
    pub fn push(&mut self, line: &OutputLine) -> ProgressEvent {
        let event = ProgressEvent::parse(&line.text);
        self.apply(line, &event);
        event
    }

    /// Display a line which has already been parsed
    ///
    /// Returns whether the visible lines changed.
    pub fn apply(&mut self, line: &OutputLine, event: &ProgressEvent) -> bool {
        let text = event.text();
        let progress_like = line.overwrites() || event.is_progress();

        if text.is_empty() {
            return false;
        }
        if self.lines.last().is_some_and(|last| last == text) {
            // Repeated flush of the line already on screen; a final flush
            // still settles it in place.
            if !progress_like {
                self.tracking_progress = false;
            }
            return false;
        }

        if progress_like {
            if self.tracking_progress {
                self.lines.pop();
            }
            self.lines.push(text.to_owned());
            self.tracking_progress = true;
        } else {
            self.lines.push(text.to_owned());
            self.tracking_progress = false;
        }

        true
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The line currently being redrawn in place, if any
    pub fn progress_line(&self) -> Option<&str> {
        self.tracking_progress
            .then(|| self.lines.last().map(String::as_str))
            .flatten()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.tracking_progress = false;
    }
}
