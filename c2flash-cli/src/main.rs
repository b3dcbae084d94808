//! c2flash - program Silicon Labs C2 microcontrollers through an Arduino bridge.
//!
//! Usage:
//!   c2flash detect
//!   c2flash read -o dump.hex
//!   c2flash write firmware.hex
//!   c2flash install-bridge --board nano

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use c2flash::Board;
use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal. Set once at startup.
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether progress bars and spinners should be drawn.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed)
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error returned by a command.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    if matches!(
        err.downcast_ref::<c2flash::Error>(),
        Some(c2flash::Error::Cancelled)
    ) {
        return 130;
    }
    1
}

/// c2flash - C2 microcontroller programmer using an Arduino bridge.
#[derive(Parser)]
#[command(name = "c2flash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Without bridge firmware on the Arduino, run `c2flash install-bridge` first.")]
pub(crate) struct Cli {
    /// Serial port of the Arduino bridge.
    #[arg(short, long, global = true, env = "C2FLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate of the bridge protocol [default: 1000000].
    #[arg(short, long, global = true, env = "C2FLASH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "C2FLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Check for the bridge firmware and identify the target MCU.
    Detect {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Read target memory.
    Read {
        /// First address (hex allowed, e.g. 0x1000).
        #[arg(long, value_parser = parse_hex_u32)]
        start: Option<u32>,

        /// End address, exclusive (hex allowed) [default: 0x37FF].
        #[arg(long, value_parser = parse_hex_u32)]
        size: Option<u32>,

        /// Bytes per read request (1-255) [default: 16].
        #[arg(long)]
        chunk: Option<usize>,

        /// Save the dump to a file instead of printing it.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Order the dump by address instead of newest first.
        #[arg(long)]
        sorted: bool,
    },

    /// Erase the target flash.
    Erase {
        /// Skip the confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Erase the target and write a HEX image.
    Write {
        /// Firmware image.
        hex: PathBuf,

        /// Skip the confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Install the C2 bridge firmware on the Arduino.
    InstallBridge {
        /// Arduino board [default: uno].
        #[arg(long)]
        board: Option<Board>,

        /// Bridge firmware image (overrides the configured image directory).
        #[arg(long, value_name = "PATH")]
        image: Option<PathBuf>,
    },

    /// Parse a HEX image without touching the hardware.
    Parse {
        /// Firmware image.
        hex: PathBuf,

        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish). Auto-detected with --install.
        shell: Option<Shell>,

        /// Install completions into the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a hex (`0x` prefix) or decimal number; underscores are ignored.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let cleaned = s.replace('_', "");
    let result = if let Some(hex) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        cleaned.parse::<u32>()
    };
    result.map_err(|e| format!("Invalid number: {s} ({e})"))
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    c2flash::set_interrupt_checker(was_interrupted);
}

/// Serial port from CLI, config or an interactive prompt.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Detect { json } => commands::target::cmd_detect(cli, &mut config, *json),
        Commands::Read {
            start,
            size,
            chunk,
            output,
            sorted,
        } => {
            let plan = config.read_plan(*start, *size, *chunk);
            commands::target::cmd_read(cli, &mut config, &plan, output.as_ref(), *sorted)
        },
        Commands::Erase { yes } => commands::target::cmd_erase(cli, &mut config, *yes),
        Commands::Write { hex, yes } => commands::target::cmd_write(cli, &mut config, hex, *yes),
        Commands::InstallBridge { board, image } => {
            commands::bridge::cmd_install_bridge(cli, &mut config, *board, image.as_ref())
        },
        Commands::Parse { hex, json } => commands::parse::cmd_parse(cli, hex, *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: c2flash completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "c2flash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_globals() {
        let cli = Cli::try_parse_from([
            "c2flash",
            "--port",
            "/dev/ttyACM0",
            "--baud",
            "500000",
            "-vv",
            "detect",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.baud, Some(500_000));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Detect { json: true }));
    }

    #[test]
    fn test_cli_parse_read_with_hex_addresses() {
        let cli = Cli::try_parse_from([
            "c2flash", "read", "--start", "0x1000", "--size", "0x2_000", "--chunk", "32", "-o",
            "dump.hex", "--sorted",
        ])
        .unwrap();
        let Commands::Read {
            start,
            size,
            chunk,
            output,
            sorted,
        } = cli.command
        else {
            panic!("expected read");
        };
        assert_eq!(start, Some(0x1000));
        assert_eq!(size, Some(0x2000));
        assert_eq!(chunk, Some(32));
        assert_eq!(output, Some(PathBuf::from("dump.hex")));
        assert!(sorted);
    }

    #[test]
    fn test_cli_parse_install_bridge_board() {
        let cli = Cli::try_parse_from(["c2flash", "install-bridge", "--board", "nano"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::InstallBridge {
                board: Some(Board::Nano),
                image: None
            }
        ));
        assert!(Cli::try_parse_from(["c2flash", "install-bridge", "--board", "mega"]).is_err());
    }

    #[test]
    fn test_cli_parse_write_requires_file() {
        assert!(Cli::try_parse_from(["c2flash", "write"]).is_err());
        let cli = Cli::try_parse_from(["c2flash", "write", "fw.hex", "-y"]).unwrap();
        assert!(matches!(cli.command, Commands::Write { yes: true, .. }));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["c2flash"]).is_err());
    }

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x37FF"), Ok(0x37FF));
        assert_eq!(parse_hex_u32("0X10"), Ok(0x10));
        assert_eq!(parse_hex_u32("1_024"), Ok(1024));
        assert!(parse_hex_u32("0xZZ").is_err());
        assert!(parse_hex_u32("").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code_for(&c2flash::Error::Cancelled.into()), 130);
        assert_eq!(
            exit_code_for(&c2flash::Error::Config("bad".into()).into()),
            1
        );
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), 1);
    }
}
