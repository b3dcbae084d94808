//! Serial port resolution.
//!
//! The bridge port is taken from the command line, then the configuration.
//! Without either, an interactive terminal is asked for the device path (and
//! whether to remember it); non-interactive runs fail with a usage error.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    dialoguer::{Confirm, Error as DialoguerError, Input, theme::ColorfulTheme},
    log::debug,
    std::io::IsTerminal,
};

/// Options for serial port resolution.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (never prompt).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "no serial port given; pass --port or set C2FLASH_PORT",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port prompt failed")
            }
        },
    }
}

/// Port from options or configuration, without prompting.
pub fn configured_port(options: &SerialOptions, config: &Config) -> Option<String> {
    options
        .port
        .clone()
        .or_else(|| config.connection.serial.clone())
        .filter(|p| !p.trim().is_empty())
}

/// Resolve the serial port to use.
pub fn select_serial_port(options: &SerialOptions, config: &mut Config) -> Result<String> {
    if let Some(port) = configured_port(options, config) {
        debug!("Using port {port}");
        return Ok(port);
    }

    if options.non_interactive {
        return Err(usage_err(
            "no serial port given; pass --port or set C2FLASH_PORT",
        ));
    }
    ensure_interactive_terminal()?;

    let port: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Serial port of the Arduino bridge")
        .interact_text()
        .map_err(map_prompt_error)?;
    let port = port.trim().to_string();
    if port.is_empty() {
        return Err(usage_err("empty serial port"));
    }

    ask_remember_port(&port, config)?;
    Ok(port)
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(port: &str, config: &mut Config) -> Result<()> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {port} for next time?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if remember {
        config.save_port(port)?;
    }
    Ok(())
}
