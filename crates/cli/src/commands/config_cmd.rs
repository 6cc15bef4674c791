//! `helloagents config` — Configuration management commands.

use super::{config_path, load_config};
use helloagents_config::AppConfig;
use std::path::Path;

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Agent:      {} (max_steps {})", config.agent.name, config.agent.max_steps);
    println!(
        "   Context:    {} tokens, {} available",
        config.context.max_tokens,
        config.context.available_tokens()
    );
    println!("   Workspace:  {}", config.terminal.workspace.display());

    Ok(())
}

/// Settings that are valid but probably not intended.
fn warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if !config.agent.finalize_on_max_steps {
        warnings.push("finalize_on_max_steps = false: unfinished runs return a fixed apology");
    }
    if !config.agent.early_stop_on_repeat {
        warnings.push("early_stop_on_repeat = false: repeated actions run until max_steps");
    }
    if config.terminal.default_shell_mode {
        warnings.push("terminal.default_shell_mode = true: commands go through sh -c by default");
    }
    if config.context.available_tokens() < 256 {
        warnings.push("context budget below 256 tokens: most sections will be truncated");
    }
    if config.context.tokenizer_path.is_some() && !cfg!(feature = "bpe") {
        warnings.push("context.tokenizer_path is set but this build lacks the `bpe` feature");
    }
    warnings
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path(path).display());
    Ok(())
}

pub async fn init(path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let target = config_path(path);
    write_default(&target, force)?;
    println!("✅ Wrote default config to {}", target.display());
    Ok(())
}

fn write_default(target: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if target.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", target.display()).into());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, AppConfig::default_toml())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = config_path(None);
        assert!(path.to_str().unwrap().ends_with("config.toml"));
        assert_eq!(config_path(Some(Path::new("x.toml"))), Path::new("x.toml"));
    }

    #[test]
    fn init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/config.toml");
        write_default(&target, false).unwrap();

        let loaded = AppConfig::load_from(&target).unwrap();
        assert_eq!(loaded.agent.max_steps, 20);
        assert!(write_default(&target, false).is_err());
        assert!(write_default(&target, true).is_ok());
    }

    #[test]
    fn defaults_have_no_warnings() {
        assert!(warnings(&AppConfig::default()).is_empty());
    }
}
