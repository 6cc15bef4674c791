//! `helloagents context` — Build a context window and report its budget.

use super::load_config;
use helloagents_agent::{ContextBuilder, ContextInput};
use helloagents_core::message::Message;
use std::path::Path;

pub async fn run(
    config_path: Option<&Path>,
    query: &str,
    instructions: Option<&str>,
    history: Option<&Path>,
    base: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let history = match history {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };

    let builder = ContextBuilder::new(config.context.clone());
    let mut input = ContextInput::new(query).with_history(&history);
    if let Some(instructions) = instructions {
        input = input.with_instructions(instructions);
    }

    let built = if base {
        builder.build_base_with_report(&input).await
    } else {
        builder.build_with_report(&input).await
    };

    println!("{}", built.text);

    let report = &built.report;
    eprintln!();
    eprintln!("📊 Context report");
    eprintln!("   Tokens:      {} / {}", report.total_tokens, report.budget);
    eprintln!(
        "   Packets:     {} selected of {} gathered",
        report.packets_selected, report.packets_gathered
    );
    eprintln!("   Compression: {:?}", report.compression);
    for drop in &report.drops {
        eprintln!("   - dropped {} ({} tokens): {}", drop.kind, drop.tokens, drop.reason);
    }

    Ok(())
}

fn load_history(path: &Path) -> Result<Vec<Message>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read history {}: {e}", path.display()))?;
    let messages = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid history JSON in {}: {e}", path.display()))?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use helloagents_core::message::Role;

    #[test]
    fn history_file_without_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"[{"role": "user", "content": "hi"}, {"role": "assistant", "content": "hello"}]"#,
        )
        .unwrap();

        let history = load_history(&path).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[0].content, "hi");
    }

    #[test]
    fn malformed_history_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_history(&path).unwrap_err().to_string();
        assert!(err.contains("Invalid history JSON"));
    }
}
