//! Types and functions for the command-line interface
//!
//! The `rowflash` binary is a thin wrapper around this module. The functions
//! here act as the coordinator: blocking work is handed to the [worker]
//! module and its events are rendered as progress bars and tables.
//!
//! No stability guarantees apply
//!
//! [worker]: crate::worker

use std::{
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    time::Duration,
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};

pub use self::config::Config;
use crate::{
    download::{download_client, DOWNLOAD_TIMEOUT},
    error::Error,
    flash_map::{self, parse_entry, to_argument_list, verify, FlashEntry},
    probe::{effective_baud, Prober, DEFAULT_BAUD},
    progress::{ConsoleView, ProgressEvent},
    release::{compatible_boards, find_asset, format_profile_name, rower_profiles, GithubClient, ReleaseSnapshot},
    serial::{list_ports, select_port, DevicePort},
    targets::Chip,
    tool::{Esptool, Invocation, PortLocks, ToolCommand, Verb},
    worker::{spawn_download, spawn_release_fetch, spawn_selection, spawn_tool, SharedTool, WorkerEvent},
};

pub mod config;

/// Establish a connection with a target device
#[derive(Debug, Args, Clone)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "ROWFLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with target device
    #[arg(short = 'B', long, env = "ROWFLASH_BAUD")]
    pub baud: Option<u32>,
    /// Target device, skips identifying the chip by probing
    #[arg(short = 'c', long)]
    pub chip: Option<Chip>,
    /// esptool executable to run, e.g. `esptool.py`
    #[arg(long, env = "ROWFLASH_ESPTOOL")]
    pub esptool: Option<String>,
}

/// List the firmware published in the latest release
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ReleasesArgs {
    /// Only list boards with firmware for this chip
    #[arg(short = 'c', long, requires = "rower")]
    pub chip: Option<Chip>,
    /// Rower profile to list compatible boards for
    #[arg(short = 'r', long)]
    pub rower: Option<String>,
}

/// Show where the files of a firmware build would be written
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct MapArgs {
    /// Directory containing the firmware build artifacts
    pub dir: PathBuf,
    /// Chip determining the flash addresses
    #[arg(short = 'c', long)]
    pub chip: Option<Chip>,
}

/// Write firmware to a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Directory containing custom firmware build artifacts
    #[arg(short = 'd', long, conflicts_with_all = ["rower", "board"])]
    pub dir: Option<PathBuf>,
    /// Rower profile of the precompiled firmware
    #[arg(short = 'r', long, requires = "board")]
    pub rower: Option<String>,
    /// Board profile of the precompiled firmware
    #[arg(short = 'b', long, requires = "rower")]
    pub board: Option<String>,
    /// Add or replace a flash entry
    #[arg(long = "entry", value_name = "ADDRESS:PATH", value_parser = parse_entry)]
    pub entries: Vec<FlashEntry>,
    /// Directory precompiled firmware is extracted into [default: system temp]
    #[arg(long, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,
    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// How the output of the flashing tool is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Progress bar, with the remaining output printed above it
    Bar,
    /// Spinner, for operations without progress reports
    Spinner,
    /// Every line of output as it is printed
    Lines,
}

/// A serial port with an (optionally identified) device attached
pub struct Session {
    pub port: String,
    pub chip: Chip,
    pub baud: u32,
    tool: SharedTool,
    locks: PortLocks,
}

impl Session {
    pub fn new(port: impl Into<String>, chip: Chip, baud: u32, tool: SharedTool) -> Self {
        Self {
            port: port.into(),
            chip,
            baud,
            tool,
            locks: PortLocks::new(),
        }
    }

    /// A command for the device of this session
    pub fn command(&self, verb: Verb) -> ToolCommand {
        ToolCommand::new(verb).port(&self.port).baud(self.baud)
    }

    /// A read-only command, which leaves the device in its loader rather than
    /// resetting it
    pub fn query_command(&self, verb: Verb) -> ToolCommand {
        self.command(verb).no_reset()
    }

    /// Run `command` on a worker, rendering its output until it exits
    pub fn run(&self, command: ToolCommand, feedback: Feedback) -> Result<Invocation> {
        let verb = command.verb();
        let (tx, rx) = mpsc::channel();
        spawn_tool(tx, self.tool.clone(), self.locks.clone(), command);

        let bar = match feedback {
            Feedback::Bar => percent_bar(),
            Feedback::Spinner => spinner(format!("Running {verb}...")),
            Feedback::Lines => ProgressBar::hidden(),
        };

        let mut view = ConsoleView::new();
        let invocation = wait_for(&rx, |event| match event {
            WorkerEvent::Output { line, event } => {
                if view.apply(&line, &event) {
                    render(&bar, feedback, &event);
                }
                None
            }
            WorkerEvent::Finished { invocation, .. } => Some(invocation),
            _ => None,
        })?;
        bar.finish_and_clear();

        debug!("{verb} exited with {}", invocation.code);

        if invocation.success() {
            Ok(invocation)
        } else {
            Err(Error::ToolFailed {
                verb: verb.to_string(),
                code: invocation.code,
            }
            .into())
        }
    }
}

/// Select the serial port and identify the device attached to it
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Session> {
    let program = args.esptool.as_deref().unwrap_or(config.program());
    let tool: SharedTool = Arc::new(Esptool::new(program));
    let locks = PortLocks::new();

    let baud = args.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
    let preferred = args.port.clone().or_else(|| config.connection.serial.clone());
    let ports = list_ports();

    let selection = match args.chip {
        Some(chip) => {
            let prober = Prober::new(tool.as_ref(), &locks, baud);
            let mut selection = select_port(ports, &prober, preferred.as_deref(), false);
            selection.detected_chip = Some(chip);
            selection
        }
        None => {
            let (tx, rx) = mpsc::channel();
            let spinner = spinner("Identifying device...");
            spawn_selection(tx, tool.clone(), locks.clone(), ports, preferred, baud);

            let selection = wait_for(&rx, |event| match event {
                WorkerEvent::Selected(selection) => Some(selection),
                _ => None,
            })?;
            spinner.finish_and_clear();
            selection
        }
    };

    let port = selection.port.ok_or(Error::NoSerial)?;
    let chip = selection.detected_chip.unwrap_or_default();
    let baud = effective_baud(chip, baud);

    println!("Serial port: '{port}'");
    if chip.is_known() {
        println!("Chip type:   {}", chip.to_string().green());
    } else {
        println!("Chip type:   {}", "unknown".yellow());
    }

    Ok(Session {
        port,
        chip,
        baud,
        tool,
        locks,
    })
}

/// Print the serial ports of the host, highlighting USB-serial bridges
pub fn print_ports(ports: &[DevicePort]) {
    if ports.is_empty() {
        println!("No serial ports detected");
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Port")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Description")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Hardware ID")
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
        ]);

    for port in ports {
        let mut path = Cell::new(&port.path).fg(Color::Green);
        if port.is_bridge() {
            path = path.add_attribute(Attribute::Bold);
        }

        table.add_row(vec![
            path,
            Cell::new(&port.description).fg(Color::Cyan),
            Cell::new(&port.hardware_id).fg(Color::Magenta),
        ]);
    }

    println!("{table}");
}

/// Print which file is written to which address
pub fn print_flash_map(entries: &[FlashEntry]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Address")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Cell::new("File")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
        ]);

    for entry in entries {
        table.add_row(vec![
            Cell::new(entry.address_text()).fg(Color::Red),
            Cell::new(entry.path.display()).fg(Color::Green),
        ]);
    }

    println!("{table}");
}

/// Identify the attached device and print its flash layout
pub fn detect(args: &ConnectArgs, config: &Config) -> Result<()> {
    let session = connect(args, config)?;
    if !session.chip.is_known() {
        println!("{}", "Chip detection failed".red());
        return Ok(());
    }

    let profile = session.chip.flash_profile();
    println!("Baud rate:   {}", session.baud);
    println!("Bootloader:  {:#x}", profile.bootloader_addr);
    println!("Partitions:  {:#x}", profile.partition_addr);
    println!("Application: {:#x}", profile.app_addr);
    println!("Flash mode:  {} @ {}", profile.flash_mode, profile.flash_freq);

    Ok(())
}

/// List the rower profiles, and boards, the latest release has firmware for
pub fn releases(args: &ReleasesArgs, config: &Config) -> Result<()> {
    let client = GithubClient::new()?;
    let release = fetch_release(&client, config)?;

    println!("Latest release: {}", release.tag.as_str().bold());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Rower profile")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Name")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
        ]);
    for rower in rower_profiles(&release) {
        table.add_row(vec![
            Cell::new(&rower).fg(Color::Green),
            Cell::new(format_profile_name(&rower)).fg(Color::Cyan),
        ]);
    }
    println!("{table}");

    if let (Some(rower), Some(chip)) = (&args.rower, args.chip) {
        let boards = compatible_boards(&release.assets, chip, rower);
        if boards.is_empty() {
            println!("No firmware for {rower} on {chip}");
        } else {
            println!("Boards with {rower} firmware for {chip}:");
            for board in boards {
                println!("  {board}");
            }
        }
    }

    Ok(())
}

/// Print the flash map of a firmware build directory
pub fn map(args: &MapArgs) -> Result<()> {
    let entries = flash_map::from_directory(&args.dir, args.chip)?;
    if entries.is_empty() {
        println!("No firmware files found in {}", args.dir.display());
    } else {
        print_flash_map(&entries);
    }

    Ok(())
}

/// Write custom or precompiled firmware to the device
pub fn flash(args: FlashArgs, connect_args: &ConnectArgs, config: &Config) -> Result<()> {
    let session = connect(connect_args, config)?;

    let mut entries = match (&args.dir, &args.rower, &args.board) {
        (Some(dir), _, _) => flash_map::from_directory(dir, Some(session.chip))?,
        (None, Some(rower), Some(board)) => {
            precompiled(&session, config, rower, board, args.download_dir.clone())?
        }
        _ => Vec::new(),
    };
    apply_overrides(&mut entries, args.entries);

    verify(&entries)?;
    print_flash_map(&entries);

    if !args.yes {
        confirm(&format!(
            "Write {} file(s) to the device on {}?",
            entries.len(),
            session.port
        ))?;
    }

    let profile = session.chip.flash_profile();
    let command = session
        .command(Verb::WriteFlash)
        .flash_mode(config.flash.mode.as_deref().unwrap_or(profile.flash_mode))
        .flash_freq(config.flash.frequency.as_deref().unwrap_or(profile.flash_freq))
        .files(to_argument_list(&entries));

    session.run(command, Feedback::Bar)?;
    println!("Flashing has completed!");

    Ok(())
}

/// Erase the entire flash of the device
pub fn erase(args: &ConnectArgs, config: &Config, yes: bool) -> Result<()> {
    let session = connect(args, config)?;

    if !yes {
        confirm(&format!(
            "Erase the entire flash of the device on {}?",
            session.port
        ))?;
    }

    session.run(session.command(Verb::EraseFlash), Feedback::Spinner)?;
    println!("Flash has been erased!");

    Ok(())
}

/// Run a read-only verb and print everything the tool prints
pub fn query(args: &ConnectArgs, config: &Config, verb: Verb) -> Result<()> {
    let session = connect(args, config)?;
    session.run(session.query_command(verb), Feedback::Lines)?;

    Ok(())
}

fn precompiled(
    session: &Session,
    config: &Config,
    rower: &str,
    board: &str,
    download_dir: Option<PathBuf>,
) -> Result<Vec<FlashEntry>> {
    if !session.chip.is_known() {
        return Err(Error::ChipUnknown.into());
    }

    let client = GithubClient::new()?;
    let release = fetch_release(&client, config)?;

    let asset = find_asset(&release, rower, board, session.chip).ok_or_else(|| {
        Error::FirmwareNotFound {
            rower: rower.to_owned(),
            board: board.to_owned(),
            chip: session.chip.to_string(),
        }
    })?;
    println!("Firmware:    {} ({})", asset.name, release.tag);

    let dest = download_dir.unwrap_or_else(std::env::temp_dir);
    let dir = download(&asset.download_url, dest)?;

    Ok(flash_map::from_directory(&dir, Some(session.chip))?)
}

fn fetch_release(client: &GithubClient, config: &Config) -> Result<ReleaseSnapshot> {
    let (tx, rx) = mpsc::channel();
    let spinner = spinner("Fetching release information...");
    spawn_release_fetch(
        tx,
        Arc::new(client.clone()),
        config.endpoint().to_owned(),
        config.retry_policy(),
    );

    let release = wait_for(&rx, |event| match event {
        WorkerEvent::Release(release) => Some(release),
        _ => None,
    })?;
    spinner.finish_and_clear();

    Ok(release?)
}

fn download(url: &str, dest: PathBuf) -> Result<PathBuf> {
    let (tx, rx) = mpsc::channel();
    spawn_download(tx, download_client(DOWNLOAD_TIMEOUT)?, url.to_owned(), dest);

    let bar = ProgressBar::new(0).with_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {bytes:>9}/{total_bytes:9} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );

    let mut last_status = String::new();
    let extracted = wait_for(&rx, |event| match event {
        WorkerEvent::DownloadProgress { done, total } => {
            bar.set_length(total);
            bar.set_position(done);
            None
        }
        WorkerEvent::Status(message) => {
            bar.set_message(message.clone());
            last_status = message;
            None
        }
        WorkerEvent::ExtractStart => {
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            None
        }
        WorkerEvent::Downloaded(extracted) => Some(extracted),
        _ => None,
    })?;
    bar.finish_and_clear();

    extracted.ok_or(Error::DownloadFailed).wrap_err(last_status)
}

/// Replace the entries at the same addresses, append the others
fn apply_overrides(entries: &mut Vec<FlashEntry>, overrides: Vec<FlashEntry>) {
    for entry in overrides {
        match entries.iter_mut().find(|e| e.address == entry.address) {
            Some(existing) => existing.path = entry.path,
            None => entries.push(entry),
        }
    }
}

fn confirm(prompt: &str) -> Result<()> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact_opt()
        .into_diagnostic()?
        .unwrap_or_default();

    if confirmed {
        Ok(())
    } else {
        Err(Error::Cancelled.into())
    }
}

/// Block until a worker sends the event `accept` is looking for
fn wait_for<T>(
    rx: &Receiver<WorkerEvent>,
    mut accept: impl FnMut(WorkerEvent) -> Option<T>,
) -> Result<T, Error> {
    for event in rx {
        if let Some(value) = accept(event) {
            return Ok(value);
        }
    }

    Err(Error::WorkerLost)
}

fn render(bar: &ProgressBar, feedback: Feedback, event: &ProgressEvent) {
    if feedback == Feedback::Bar {
        if let Some(percent) = event.percent() {
            bar.set_position(percent.round() as u64);
        }
        if event.is_progress() {
            bar.set_message(event.text().to_owned());
            return;
        }
    }

    if bar.is_hidden() {
        println!("{}", event.text());
    } else {
        bar.println(event.text());
    }
}

fn percent_bar() -> ProgressBar {
    ProgressBar::new(100).with_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {pos:>3}% {wide_msg}")
            .unwrap()
            .progress_chars("=> "),
    )
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {msg}")
        .unwrap()
}

fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner()
        .with_style(spinner_style())
        .with_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
