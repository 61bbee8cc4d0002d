use clap::{Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use rowflash::{
    cli::{
        detect, erase, flash, map, print_ports, query, releases, Config, ConnectArgs,
        FlashArgs as BaseFlashArgs, MapArgs, ReleasesArgs,
    },
    logging::initialize_logger,
    serial::list_ports,
    tool::Verb,
};

#[derive(Debug, Parser)]
#[command(about, propagate_version = true, version)]
struct Cli {
    /// Print debug information, including the flashing tool's command lines
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the serial ports of this host
    ListPorts,
    /// Identify the chip of the connected device
    Detect(ConnectArgs),
    /// List the precompiled firmware of the latest release
    Releases(ReleasesArgs),
    /// Show which file of a firmware build is written to which address
    Map(MapArgs),
    /// Write custom or precompiled firmware to the connected device
    Flash(FlashArgs),
    /// Erase the entire flash of the connected device
    Erase(EraseArgs),
    /// Print the MAC address of the connected device
    ReadMac(ConnectArgs),
    /// Print the identity reported by the connected device
    ChipId(ConnectArgs),
}

#[derive(Debug, Args)]
struct FlashArgs {
    #[command(flatten)]
    connect_args: ConnectArgs,
    #[command(flatten)]
    flash_args: BaseFlashArgs,
}

#[derive(Debug, Args)]
struct EraseArgs {
    #[command(flatten)]
    connect_args: ConnectArgs,
    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    let cli = Cli::parse();
    initialize_logger(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let args = cli.subcommand;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args {
        Commands::ListPorts => {
            print_ports(&list_ports());
            Ok(())
        }
        Commands::Detect(args) => detect(&args, &config),
        Commands::Releases(args) => releases(&args, &config),
        Commands::Map(args) => map(&args),
        Commands::Flash(args) => flash(args.flash_args, &args.connect_args, &config),
        Commands::Erase(args) => erase(&args.connect_args, &config, args.yes),
        Commands::ReadMac(args) => query(&args, &config, Verb::ReadMac),
        Commands::ChipId(args) => query(&args, &config, Verb::ChipId),
    }
}
