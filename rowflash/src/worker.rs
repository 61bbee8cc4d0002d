//! Background workers
//!
//! Every blocking operation (probing, fetching release metadata, downloading,
//! running the flashing tool) runs on its own thread. Workers never touch the
//! coordinator's state: they report progress and results as [WorkerEvent]s on
//! a channel. A coordinator which loses interest simply drops the receiver;
//! the worker still runs to completion and its messages are discarded.

use std::{
    path::PathBuf,
    sync::{mpsc::Sender, Arc},
    thread::{self, JoinHandle},
};

use log::debug;
use reqwest::blocking::Client;

use crate::{
    download::download_and_extract,
    error::Error,
    probe::Prober,
    progress::{DownloadCallbacks, ProgressEvent},
    release::{fetch_latest, ReleaseApi, ReleaseSnapshot, RetryPolicy},
    serial::{select_port, DevicePort, Selection},
    tool::{FlashTool, Invocation, OutputLine, PortLocks, ToolCommand, Verb},
};

/// A flashing tool which can be shared with worker threads
pub type SharedTool = Arc<dyn FlashTool + Send + Sync>;
/// A release source which can be shared with worker threads
pub type SharedReleaseApi = Arc<dyn ReleaseApi + Send + Sync>;

/// Messages sent from a worker to the coordinator
#[derive(Debug)]
pub enum WorkerEvent {
    /// A line printed by the flashing tool, and what it reported
    Output {
        line: OutputLine,
        event: ProgressEvent,
    },
    /// Bytes of the firmware archive received so far
    DownloadProgress { done: u64, total: u64 },
    /// Stage of the download pipeline, or the reason it failed
    Status(String),
    /// Extraction of the firmware archive has begun
    ExtractStart,
    /// A serial port has been selected
    Selected(Selection),
    /// Release metadata has been fetched, or could not be
    Release(Result<ReleaseSnapshot, Error>),
    /// The firmware archive has been extracted to the given directory, or
    /// the pipeline failed
    Downloaded(Option<PathBuf>),
    /// The flashing tool has exited
    Finished { verb: Verb, invocation: Invocation },
}

/// Select a serial port, probing candidates with the flashing tool
pub fn spawn_selection(
    tx: Sender<WorkerEvent>,
    tool: SharedTool,
    locks: PortLocks,
    ports: Vec<DevicePort>,
    preferred: Option<String>,
    baud: u32,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let prober = Prober::new(tool.as_ref(), &locks, baud);
        let selection = select_port(ports, &prober, preferred.as_deref(), true);

        send(&tx, WorkerEvent::Selected(selection));
    })
}

/// Fetch the latest release
pub fn spawn_release_fetch(
    tx: Sender<WorkerEvent>,
    api: SharedReleaseApi,
    endpoint: String,
    policy: RetryPolicy,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let release = fetch_latest(api.as_ref(), &endpoint, &policy);
        send(&tx, WorkerEvent::Release(release));
    })
}

/// Download a firmware archive and extract it below `dest_dir`
pub fn spawn_download(
    tx: Sender<WorkerEvent>,
    client: Client,
    url: String,
    dest_dir: PathBuf,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut callbacks = ChannelCallbacks { tx: tx.clone() };
        let extracted = download_and_extract(&client, &url, &dest_dir, &mut callbacks);

        send(&tx, WorkerEvent::Downloaded(extracted));
    })
}

/// Run the flashing tool, streaming its output line by line
pub fn spawn_tool(
    tx: Sender<WorkerEvent>,
    tool: SharedTool,
    locks: PortLocks,
    command: ToolCommand,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let invocation = command.run(tool.as_ref(), &locks, &mut |line| {
            let event = ProgressEvent::parse(&line.text);
            send(&tx, WorkerEvent::Output { line, event });
        });

        send(
            &tx,
            WorkerEvent::Finished {
                verb: command.verb(),
                invocation,
            },
        );
    })
}

fn send(tx: &Sender<WorkerEvent>, event: WorkerEvent) {
    if tx.send(event).is_err() {
        debug!("Coordinator is gone, discarding worker event");
    }
}

/// Forwards download progress to the coordinator
struct ChannelCallbacks {
    tx: Sender<WorkerEvent>,
}

impl DownloadCallbacks for ChannelCallbacks {
    fn progress(&mut self, done: u64, total: u64) {
        send(&self.tx, WorkerEvent::DownloadProgress { done, total });
    }

    fn status(&mut self, message: &str) {
        send(&self.tx, WorkerEvent::Status(message.to_owned()));
    }

    fn extract_start(&mut self) {
        send(&self.tx, WorkerEvent::ExtractStart);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;
    use crate::{
        error::{ToolFault, TransportError},
        targets::Chip,
        tool::{OutputSink, Stream, Termination},
    };

    struct Echo(&'static str);

    impl FlashTool for Echo {
        fn execute(
            &self,
            _args: &[String],
            sink: &mut OutputSink<'_>,
        ) -> Result<Termination, ToolFault> {
            sink.write_str(Stream::Stdout, self.0);
            Ok(Termination::Exit(Some(0)))
        }
    }

    struct Offline;

    impl ReleaseApi for Offline {
        fn latest_release(&self, _endpoint: &str) -> Result<ReleaseSnapshot, TransportError> {
            Err(TransportError::Status {
                status: 404,
                reason: "Not Found".to_owned(),
            })
        }
    }

    #[test]
    fn tool_output_is_streamed_before_the_result() {
        let (tx, rx) = mpsc::channel();
        let tool: SharedTool = Arc::new(Echo(
            "Writing at 0x00010000... (50 %)\rWriting at 0x00020000... (100 %)\nHash of data verified.\n",
        ));

        let command = ToolCommand::new(Verb::WriteFlash).port("COM3");
        spawn_tool(tx, tool, PortLocks::new(), command)
            .join()
            .unwrap();

        let events = rx.iter().collect::<Vec<_>>();
        assert_eq!(events.len(), 4);

        match &events[0] {
            WorkerEvent::Output { line, event } => {
                assert!(line.overwrites());
                assert_eq!(event.percent(), Some(50.0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            &events[2],
            WorkerEvent::Output { event: ProgressEvent::Line { text }, .. } if text == "Hash of data verified."
        ));
        assert!(matches!(
            &events[3],
            WorkerEvent::Finished { verb: Verb::WriteFlash, invocation } if invocation.success()
        ));
    }

    #[test]
    fn selection_probes_through_the_tool() {
        let (tx, rx) = mpsc::channel();
        let tool: SharedTool = Arc::new(Echo("Chip is ESP32-C3 (QFN32)\n"));
        let ports = vec![DevicePort::new("/dev/ttyACM0", "n/a", "n/a")];

        spawn_selection(tx, tool, PortLocks::new(), ports, None, 115_200);

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Selected(selection) => {
                assert_eq!(selection.port.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(selection.detected_chip, Some(Chip::Esp32c3));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn failed_fetch_is_reported_as_a_message() {
        let (tx, rx) = mpsc::channel();
        let policy = RetryPolicy {
            attempts: 2,
            delay: Duration::ZERO,
        };

        spawn_release_fetch(tx, Arc::new(Offline), "http://localhost/".to_owned(), policy);

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Release(Err(Error::ReleaseUnavailable(message))) => {
                assert_eq!(message, "Attempt 2/2 failed: HTTP 404: Not Found")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn workers_finish_after_the_coordinator_leaves() {
        let (tx, rx) = mpsc::channel();
        drop(rx);

        let locks = PortLocks::new();
        let handle = spawn_tool(
            tx,
            Arc::new(Echo("Chip is ESP32\n")),
            locks.clone(),
            ToolCommand::new(Verb::ChipId).port("COM3"),
        );

        assert!(handle.join().is_ok());
        assert!(!locks.is_held("COM3"));
    }
}
