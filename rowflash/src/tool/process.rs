//! esptool as a child process

use std::{
    io::{self, Read},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Sender},
    thread,
};

use log::{debug, warn};

use super::{FlashTool, OutputSink, Stream, Termination};
use crate::error::ToolFault;

/// Default name of the esptool executable
pub const DEFAULT_PROGRAM: &str = "esptool";

/// Runs the esptool executable found at `program`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esptool {
    program: String,
}

impl Esptool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Esptool {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl FlashTool for Esptool {
    fn program(&self) -> &str {
        &self.program
    }

    fn execute(
        &self,
        args: &[String],
        sink: &mut OutputSink<'_>,
    ) -> Result<Termination, ToolFault> {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolFault::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut child = ChildGuard::new(child);
        debug!("Spawned {} (pid {})", self.program, child.id());

        let stdout = child.take_stdout()?;
        let stderr = child.take_stderr()?;

        // Both streams are read concurrently so neither pipe can fill up and
        // stall the tool; chunks are forwarded in the order they arrive.
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            let out = s.spawn({
                let tx = tx.clone();
                move || pump(stdout, Stream::Stdout, tx)
            });
            let err = s.spawn(move || pump(stderr, Stream::Stderr, tx));

            for (stream, chunk) in rx {
                sink.write(stream, &chunk);
            }

            for handle in [out, err] {
                handle
                    .join()
                    .map_err(|_| ToolFault::Other("output reader panicked".to_owned()))??;
            }

            Ok::<_, ToolFault>(())
        })?;

        let status = child.wait()?;
        debug!("{} exited with {status}", self.program);

        termination(status)
    }
}

fn termination(status: ExitStatus) -> Result<Termination, ToolFault> {
    match status.code() {
        Some(code) => Ok(Termination::Exit(Some(code))),
        None => Err(ToolFault::Signal),
    }
}

fn pump(mut reader: impl Read, stream: Stream, tx: Sender<(Stream, Vec<u8>)>) -> io::Result<()> {
    let mut buffer = [0u8; 1024];
    loop {
        let len = match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if tx.send((stream, buffer[..len].to_vec())).is_err() {
            return Ok(());
        }
    }
}

/// Child process which is killed and reaped if it is still running when
/// dropped, so the serial port it holds is always released.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Result<impl Read + Send + 'static, ToolFault> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| ToolFault::Other("stdout was not captured".to_owned()))
    }

    fn take_stderr(&mut self) -> Result<impl Read + Send + 'static, ToolFault> {
        self.child
            .stderr
            .take()
            .ok_or_else(|| ToolFault::Other("stderr was not captured".to_owned()))
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }

        if let Err(e) = self.child.kill() {
            warn!("Failed to stop the flashing tool: {e}");
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap the flashing tool: {e}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tool::{run, run_with, FAULT_EXIT_CODE};

    fn sh(script: &str) -> (Esptool, Vec<String>) {
        (
            Esptool::new("sh"),
            vec!["-c".to_owned(), script.to_owned()],
        )
    }

    #[test]
    fn exit_code_is_forwarded() {
        let (tool, args) = sh("echo 'A fatal error occurred'; exit 5");
        let result = run(&tool, &args);

        assert_eq!(result.code, 5);
        assert_eq!(result.output, "A fatal error occurred");
    }

    #[test]
    fn both_streams_are_captured() {
        let (tool, args) = sh("printf 'Writing (50 %%)\\rWriting (100 %%)\\r'; echo oops >&2; printf done");

        let mut lines = Vec::new();
        let result = run_with(&tool, &args, &mut |line| lines.push(line.text));

        assert_eq!(result.code, 0);
        assert!(lines.contains(&"Writing (50 %)".to_owned()));
        assert!(lines.contains(&"Writing (100 %)".to_owned()));
        assert!(lines.contains(&"oops".to_owned()));
        assert_eq!(lines.last().map(String::as_str), Some("done"));
        assert!(result.output.ends_with("oops"));
    }

    #[test]
    fn missing_program_is_a_fault() {
        let tool = Esptool::new("rowflash-test-no-such-program");
        let result = run(&tool, &["version".to_owned()]);

        assert_eq!(result.code, FAULT_EXIT_CODE);
        assert!(result.output.starts_with("Runtime error: failed to launch"));
    }

    #[test]
    fn killed_process_is_a_fault() {
        let (tool, args) = sh("kill -9 $$");
        let result = run(&tool, &args);

        assert_eq!(result.code, FAULT_EXIT_CODE);
        assert!(result.output.contains("terminated by signal"));
    }
}
