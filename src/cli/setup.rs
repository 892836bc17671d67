use colored::Colorize;

use crate::core::error::{AgentError, Result};
use crate::core::style;

const CONFIG_TEMPLATE: &str = "\
# mdflow user configuration.
#
# Per-driver defaults merge under each command name; project configs
# (mdflow.config.yaml, .mdflow.yaml, .mdflow.json) override these.
#
# commands:
#   claude:
#     model: opus
#   codex:
#     model: gpt-5
";

/// Create the `~/.mdflow` layout: config.yaml, logs/, cache/.
pub fn run() -> Result<()> {
    let home = dirs::home_dir().ok_or_else(|| {
        AgentError::Configuration("cannot locate home directory".to_string())
    })?;
    let root = home.join(".mdflow");

    for dir in [root.clone(), root.join("logs"), root.join("cache")] {
        std::fs::create_dir_all(&dir).map_err(|e| AgentError::from_io(&dir, e))?;
    }

    let config_path = root.join("config.yaml");
    if !config_path.exists() {
        std::fs::write(&config_path, CONFIG_TEMPLATE)
            .map_err(|e| AgentError::from_io(&config_path, e))?;
        eprintln!(
            "{}",
            style::success(&format!("Wrote {}", config_path.display()))
        );
    } else {
        eprintln!(
            "{}",
            style::success(&format!("Kept existing {}", config_path.display()))
        );
    }

    eprintln!("{}", style::success(&format!("Ready: {}", root.display())));
    eprintln!();
    eprintln!("{}", "Next steps:".bold());
    eprintln!(
        "  1. Put shared agents in {} to run them from anywhere",
        root.join("<name>.<driver>.md").display().to_string().cyan()
    );
    eprintln!(
        "  2. Try {} to scaffold your first agent",
        "mdflow create hello".cyan()
    );
    Ok(())
}
