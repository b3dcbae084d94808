//! Bridge firmware installation command.

use anyhow::{Context, Result};
use c2flash::{AttemptOutcome, Board, FlashOrchestrator, HexImage, NativeOpener, Stk500Flasher};
use console::style;
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ensure_not_interrupted;
use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output};

/// Locate the bridge image: explicit path, configured directory, then `./bins`.
pub(crate) fn resolve_image_path(
    image: Option<&PathBuf>,
    config: &Config,
    board: Board,
) -> PathBuf {
    if let Some(path) = image {
        return path.clone();
    }
    let dir = config
        .bridge
        .image_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("bins"));
    board.image_path(&dir)
}

fn load_image(path: &Path) -> Result<HexImage> {
    if !path.exists() {
        return Err(CliError::Usage(format!(
            "bridge image not found: {} (pass --image or set bridge.image_dir)",
            path.display()
        ))
        .into());
    }
    let image = HexImage::from_file(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .into_valid()
        .with_context(|| format!("Bridge image {} is malformed", path.display()))?;
    Ok(image)
}

/// `install-bridge`: flash the C2 bridge firmware onto the Arduino.
pub(crate) fn cmd_install_bridge(
    cli: &Cli,
    config: &mut Config,
    board: Option<Board>,
    image: Option<&PathBuf>,
) -> Result<()> {
    let install = config.install_config(board);
    let image_path = resolve_image_path(image, config, install.board);
    let hex = load_image(&image_path)?;
    let port = get_port(cli, config)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Installing {} on {} ({port})",
            style("📦").cyan(),
            image_path.display(),
            install.board
        );
    }

    let spinner = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Flashing bridge firmware");
        pb
    };

    let mut orchestrator =
        FlashOrchestrator::new(NativeOpener::new(port), Stk500Flasher::new(), install);
    let result = orchestrator.install(&hex);
    spinner.finish_and_clear();

    if !cli.quiet {
        for attempt in orchestrator.attempts() {
            let (mark, what) = match &attempt.outcome {
                AttemptOutcome::Succeeded => (style("✓").green(), "ok".to_string()),
                AttemptOutcome::TimedOut => (
                    style("✗").red(),
                    format!("timed out after {:?}", attempt.deadline),
                ),
                AttemptOutcome::Cancelled => (style("✗").red(), "cancelled".to_string()),
                AttemptOutcome::Failed(reason) => (style("✗").red(), reason.clone()),
            };
            eprintln!("    {mark} {} baud: {what}", attempt.baud_rate);
        }
    }

    let baud = result.context("Bridge firmware installation failed")?;
    if !cli.quiet {
        eprintln!(
            "{} Bridge firmware installed at {baud} baud",
            style("✓").green()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_image_wins() {
        let mut config = Config::default();
        config.bridge.image_dir = Some(PathBuf::from("/opt/c2"));
        let explicit = PathBuf::from("custom.hex");
        assert_eq!(
            resolve_image_path(Some(&explicit), &config, Board::Uno),
            explicit
        );
    }

    #[test]
    fn test_image_from_configured_dir() {
        let mut config = Config::default();
        config.bridge.image_dir = Some(PathBuf::from("/opt/c2"));
        assert_eq!(
            resolve_image_path(None, &config, Board::Nano),
            Path::new("/opt/c2").join("uno_nano.hex")
        );
        assert_eq!(
            resolve_image_path(None, &Config::default(), Board::Uno),
            Path::new("bins").join("uno_nano.hex")
        );
    }

    #[test]
    fn test_missing_image_is_usage_error() {
        let err = load_image(Path::new("/nonexistent/uno_nano.hex")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_malformed_image_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.hex");
        std::fs::write(&path, ":0100000011EE\nnot a record\n").unwrap();
        assert!(load_image(&path).is_err());
    }
}
