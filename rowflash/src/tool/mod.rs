//! Invocation of the external flashing tool
//!
//! The tool (esptool) is treated as an opaque program which accepts a verb
//! and some flags, and prints to two output streams. [run] drives any
//! [FlashTool] implementation, captures everything it prints and streams the
//! output line by line to a callback while the tool is still running.
//!
//! A fault inside the tool never escapes [run]: it is turned into exit code
//! [FAULT_EXIT_CODE] plus a diagnostic line in the output.

use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, warn};
use strum::{Display, EnumString, VariantNames};

pub use self::{
    lease::{PortLease, PortLocks},
    lines::{LineDecoder, LineEnding, OutputLine},
    process::{Esptool, DEFAULT_PROGRAM},
};
use crate::error::ToolFault;

mod lease;
mod lines;
mod process;

/// Exit code reported when the tool failed without exiting on its own
pub const FAULT_EXIT_CODE: i32 = 2;

/// The output streams of the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// How the tool stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The tool ran to completion
    Completed,
    /// The tool requested to exit, optionally with a status code
    Exit(Option<i32>),
}

/// A flashing tool which can be invoked with command-line style arguments
pub trait FlashTool {
    /// Name the tool is invoked as, used when logging command lines
    fn program(&self) -> &str {
        DEFAULT_PROGRAM
    }

    /// Run the tool to completion, writing everything it prints to `sink`
    /// in the order it was produced.
    fn execute(&self, args: &[String], sink: &mut OutputSink<'_>)
        -> Result<Termination, ToolFault>;
}

/// Result of a single invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Exit code of the tool
    pub code: i32,
    /// Combined output of both streams, without blank lines
    pub output: String,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Default)]
struct Capture {
    raw: Vec<u8>,
    decoder: LineDecoder,
}

/// Collects the tool's output while forwarding complete lines to a callback
pub struct OutputSink<'a> {
    stdout: Capture,
    stderr: Capture,
    on_line: &'a mut dyn FnMut(OutputLine),
}

impl<'a> OutputSink<'a> {
    fn new(on_line: &'a mut dyn FnMut(OutputLine)) -> Self {
        Self {
            stdout: Capture::default(),
            stderr: Capture::default(),
            on_line,
        }
    }

    /// Record a chunk of output from one of the tool's streams
    pub fn write(&mut self, stream: Stream, bytes: &[u8]) {
        let capture = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        capture.raw.extend_from_slice(bytes);
        capture.decoder.feed(bytes, self.on_line);
    }

    /// Convenience for tools producing text
    pub fn write_str(&mut self, stream: Stream, text: &str) {
        self.write(stream, text.as_bytes());
    }

    fn finish(mut self) -> String {
        self.stdout.decoder.finish(self.on_line);
        self.stderr.decoder.finish(self.on_line);

        let mut combined = String::from_utf8_lossy(&self.stdout.raw).into_owned();
        combined.push_str(&String::from_utf8_lossy(&self.stderr.raw));

        combined
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run the tool, discarding the streamed lines
pub fn run(tool: &dyn FlashTool, args: &[String]) -> Invocation {
    run_with(tool, args, &mut |_| {})
}

/// Run the tool, passing each line of output to `on_line` as it arrives
pub fn run_with(
    tool: &dyn FlashTool,
    args: &[String],
    on_line: &mut dyn FnMut(OutputLine),
) -> Invocation {
    debug!("Running: {}", pretty_command(tool.program(), args));

    let mut sink = OutputSink::new(on_line);
    let outcome = catch_unwind(AssertUnwindSafe(|| tool.execute(args, &mut sink)))
        .unwrap_or_else(|payload| Err(ToolFault::Panic(panic_message(payload.as_ref()))));

    let code = match outcome {
        Ok(Termination::Completed) => 0,
        Ok(Termination::Exit(code)) => code.unwrap_or(0),
        Err(fault) => {
            warn!("Flashing tool failed: {fault}");
            sink.write_str(Stream::Stderr, &format!("Runtime error: {fault}\n"));
            FAULT_EXIT_CODE
        }
    };

    Invocation {
        code,
        output: sink.finish(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("tool panicked")
    }
}

/// Render a command line for display, quoting arguments containing spaces
pub fn pretty_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|arg| {
            if arg.contains(' ') {
                format!("\"{arg}\"")
            } else {
                arg.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Operations understood by the flashing tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum Verb {
    /// Read the chip identity without writing anything
    ChipId,
    /// Read the device's MAC address
    ReadMac,
    /// Erase the entire flash
    EraseFlash,
    /// Write files to flash at the given addresses
    WriteFlash,
}

/// Builder for the tool's command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    verb: Verb,
    port: Option<String>,
    baud: Option<u32>,
    no_reset: bool,
    flash_mode: Option<String>,
    flash_freq: Option<String>,
    files: Vec<String>,
}

impl ToolCommand {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            port: None,
            baud: None,
            no_reset: false,
            flash_mode: None,
            flash_freq: None,
            files: Vec::new(),
        }
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Leave the device running the tool's loader afterwards instead of
    /// resetting it
    pub fn no_reset(mut self) -> Self {
        self.no_reset = true;
        self
    }

    pub fn flash_mode(mut self, mode: impl Into<String>) -> Self {
        self.flash_mode = Some(mode.into()).filter(|m: &String| !m.is_empty());
        self
    }

    pub fn flash_freq(mut self, freq: impl Into<String>) -> Self {
        self.flash_freq = Some(freq.into()).filter(|f: &String| !f.is_empty());
        self
    }

    /// Flattened `[address, path, ...]` list for `write-flash`
    pub fn files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// The arguments passed to the tool
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(port) = &self.port {
            args.extend(["--port".to_owned(), port.clone()]);
        }
        if let Some(baud) = self.baud {
            args.extend(["--baud".to_owned(), baud.to_string()]);
        }
        if self.no_reset {
            args.extend(["--after".to_owned(), "no-reset".to_owned()]);
        }

        args.push(self.verb.to_string());

        if self.verb == Verb::WriteFlash {
            if let Some(mode) = &self.flash_mode {
                args.extend(["--flash-mode".to_owned(), mode.clone()]);
            }
            if let Some(freq) = &self.flash_freq {
                args.extend(["--flash-freq".to_owned(), freq.clone()]);
            }
            args.extend(self.files.iter().cloned());
        }

        args
    }

    /// Run the command while holding the lease on its serial port
    pub fn run(
        &self,
        tool: &dyn FlashTool,
        locks: &PortLocks,
        on_line: &mut dyn FnMut(OutputLine),
    ) -> Invocation {
        let _lease = self.port.as_deref().map(|port| locks.acquire(port));
        run_with(tool, &self.args(), on_line)
    }
}
