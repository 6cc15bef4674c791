//! `helloagents tools` — List the default tool registry.

use super::load_config;
use helloagents_tools::default_registry;
use std::path::Path;

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let registry = default_registry(&config.terminal, None, None)?;

    println!("🔧 Tools ({})", registry.len());
    println!("   Workspace: {}", config.terminal.workspace.display());
    for schema in registry.list() {
        println!();
        println!("  {}", schema.name);
        println!("    {}", schema.description);
        for param in &schema.parameters {
            let required = if param.required { ", required" } else { "" };
            let default = param
                .default
                .as_ref()
                .map(|d| format!(", default {d}"))
                .unwrap_or_default();
            println!(
                "    - {} ({}{required}{default}): {}",
                param.name,
                param.param_type.as_str(),
                param.description
            );
        }
    }

    Ok(())
}
