//! Commands that talk to the target MCU through the bridge.

use anyhow::{Context, Result};
use c2flash::{DeviceInfo, HexImage, NativePort, Programmer, ReadPlan, Session};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use log::warn;
use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;

use super::{ensure_not_interrupted, progress_bar};
use crate::config::Config;
use crate::{Cli, CliError, get_port};

/// Open the bridge and check for its firmware.
fn connect(cli: &Cli, config: &mut Config) -> Result<Programmer<NativePort>> {
    let port = get_port(cli, config)?;
    let client_config = config.client_config(cli.baud);
    if !cli.quiet {
        eprintln!(
            "{} Using {port} at {} baud",
            style("🔌").cyan(),
            client_config.baud_rate
        );
    }
    ensure_not_interrupted()?;

    match Programmer::open(&port, &client_config) {
        Ok(programmer) => {
            if !cli.quiet {
                eprintln!("{} C2 interface detected", style("✓").green());
            }
            Ok(programmer)
        },
        Err(e @ c2flash::Error::InterfaceNotDetected(_)) => Err(anyhow::Error::new(e)
            .context("bridge firmware not found; install it with `c2flash install-bridge`")),
        Err(e) => Err(e).with_context(|| format!("Failed to open {port}")),
    }
}

/// Close the connection, keeping the first error.
fn finish<T>(programmer: Programmer<NativePort>, result: Result<T>) -> Result<T> {
    if let Err(e) = programmer.disconnect() {
        warn!("Closing the bridge connection failed: {e}");
    }
    result
}

/// Ask before a destructive operation unless `-y` or non-interactive.
fn confirm(cli: &Cli, yes: bool, prompt: &str) -> Result<()> {
    if yes || cli.non_interactive {
        return Ok(());
    }
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage("confirmation requires a terminal; pass -y".into()).into());
    }
    let accepted = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(true)
        .interact_opt()
        .map_err(|e| CliError::Usage(format!("prompt failed: {e}")))?;
    match accepted {
        Some(true) => Ok(()),
        _ => Err(CliError::Cancelled("aborted by user".into()).into()),
    }
}

fn initialize(
    cli: &Cli,
    programmer: &mut Programmer<NativePort>,
    session: &mut Session,
) -> Result<Option<DeviceInfo>> {
    let info = programmer
        .initialize_target(session)
        .context("Target initialization failed")?;
    if !cli.quiet {
        match info {
            Some(info) => eprintln!("{} {info}", style("ℹ").blue()),
            None => eprintln!("{} Device info unavailable", style("⚠").yellow()),
        }
    }
    Ok(info)
}

fn report_errors(session: &Session) {
    for e in session.errors() {
        eprintln!("    {} {e}", style("•").dim());
    }
    if session.lock_suspected() {
        eprintln!(
            "{} Reads fail on an identified target: the flash lock byte may be set",
            style("⚠").yellow()
        );
    }
}

/// `detect`: ping the bridge and identify the target.
pub(crate) fn cmd_detect(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let mut programmer = connect(cli, config)?;
    let mut session = Session::new();
    let result = initialize(cli, &mut programmer, &mut session);
    let info = finish(programmer, result)?;

    if json {
        let value = serde_json::json!({
            "detected": true,
            "device": info,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if let Some(info) = info {
        println!("{info}");
    }
    Ok(())
}

/// `read`: dump target memory.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &mut Config,
    plan: &ReadPlan,
    output: Option<&PathBuf>,
    sorted: bool,
) -> Result<()> {
    plan.validate().context("Invalid read range")?;

    let mut programmer = connect(cli, config)?;
    let mut session = Session::new();
    let result = read_with(cli, &mut programmer, &mut session, plan);
    let report = finish(programmer, result)?;

    let dump = session.dump(sorted);
    if let Some(path) = output {
        fs::write(path, format!("{dump}\n"))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Saved {} chunk(s) to {}",
                style("✓").green(),
                report.read,
                path.display()
            );
        }
    } else if !dump.is_empty() {
        println!("{dump}");
    }

    if report.failed > 0 {
        eprintln!(
            "{} {} of {} read request(s) failed",
            style("⚠").yellow(),
            report.failed,
            report.read + report.failed
        );
        report_errors(&session);
    }
    Ok(())
}

fn read_with(
    cli: &Cli,
    programmer: &mut Programmer<NativePort>,
    session: &mut Session,
    plan: &ReadPlan,
) -> Result<c2flash::ReadReport> {
    initialize(cli, programmer, session)?;
    ensure_not_interrupted()?;

    let pb = progress_bar(cli.quiet, plan.chunk_count() as u64);
    pb.set_message("Reading");
    let report = programmer.read_memory(session, plan, &mut |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    });
    pb.finish_and_clear();
    Ok(report?)
}

/// `erase`: erase the target flash.
pub(crate) fn cmd_erase(cli: &Cli, config: &mut Config, yes: bool) -> Result<()> {
    confirm(cli, yes, "Erase the whole target flash?")?;

    let mut programmer = connect(cli, config)?;
    let mut session = Session::new();
    let result = initialize(cli, &mut programmer, &mut session).and_then(|_| {
        ensure_not_interrupted()?;
        programmer
            .erase_target(&mut session)
            .context("Erase failed")
    });
    finish(programmer, result)?;

    if !cli.quiet {
        eprintln!("{} Target erased", style("✓").green());
    }
    Ok(())
}

/// `write`: erase the target and program a HEX image.
pub(crate) fn cmd_write(cli: &Cli, config: &mut Config, hex: &PathBuf, yes: bool) -> Result<()> {
    let image = HexImage::from_file(hex)
        .with_context(|| format!("Failed to read {}", hex.display()))?
        .into_valid()
        .with_context(|| format!("Refusing to write {}", hex.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {}: {} record(s), {} bytes",
            style("📦").cyan(),
            hex.display(),
            image.data_records().count(),
            image.data_len()
        );
    }

    confirm(cli, yes, "Erase the target and write this image?")?;

    let mut programmer = connect(cli, config)?;
    let mut session = Session::new();
    let result = initialize(cli, &mut programmer, &mut session).and_then(|_| {
        ensure_not_interrupted()?;
        let pb = progress_bar(cli.quiet, image.data_records().count() as u64);
        pb.set_message("Writing");
        let report = programmer.write_image(&mut session, &image, &mut |done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        });
        pb.finish_and_clear();
        Ok(report?)
    });
    let report = finish(programmer, result)?;

    if report.failed > 0 {
        report_errors(&session);
        anyhow::bail!(
            "{} of {} record(s) failed to write",
            report.failed,
            report.total
        );
    }
    if !cli.quiet {
        eprintln!(
            "{} Wrote {} record(s)",
            style("✓").green(),
            report.written
        );
    }
    Ok(())
}
