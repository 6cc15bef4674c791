//! `helloagents exec` — Run one command through the terminal tool.

use super::load_config;
use helloagents_tools::TerminalTool;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

pub async fn run(
    config_path: Option<&Path>,
    command: &str,
    shell: bool,
    allow_dangerous: bool,
    workspace: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config_path)?.terminal;
    if let Some(workspace) = workspace {
        config.workspace = workspace;
    }

    let mut tool = TerminalTool::new(&config)?;
    if config.confirm_dangerous {
        tool = tool.with_confirm(ask_user);
    }

    tracing::debug!(command, shell, allow_dangerous, "exec");
    let output = tool.run_command(command, allow_dangerous, shell).await?;
    println!("{output}");
    Ok(())
}

/// Interactive y/N prompt on stderr. Anything but `y`/`yes` declines.
fn ask_user(command: &str) -> bool {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "⚠️  About to run a dangerous command:\n   {command}\nProceed? [y/N] ");
    let _ = stderr.flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    is_yes(&answer)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }
}
