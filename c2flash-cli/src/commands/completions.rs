//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN_NAME: &str = "c2flash";

fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Shell named by a binary path such as `/usr/bin/zsh`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Where a completion script for `shell` is installed, given the user's
/// home, config and data directories.
fn install_path(shell: Shell, home: &Path, config: &Path, data: &Path) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => data
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME),
        Shell::Zsh => home.join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => config
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::PowerShell => config
            .join("powershell")
            .join("completions")
            .join(format!("{BIN_NAME}.ps1")),
        Shell::Elvish => config
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Post-install hint for activating the completions.
fn activation_hint(shell: Shell, path: &Path) -> String {
    match shell {
        Shell::Bash => format!("source {}", path.display()),
        Shell::Zsh => "add `fpath=(~/.zfunc $fpath)` to ~/.zshrc, then `exec zsh`".into(),
        Shell::PowerShell => format!("Import-Module {}", path.display()),
        _ => "open a new shell".into(),
    }
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             c2flash completions --install bash",
        )?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, dirs.home_dir(), dirs.config_dir(), dirs.data_dir())?;

    let mut buf = Vec::new();
    render(shell, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {shell} completions to {}",
        style("✓").green().bold(),
        style(path.display()).yellow()
    );
    eprintln!("To activate: {}", style(activation_hint(shell, &path)).cyan());
    Ok(())
}
