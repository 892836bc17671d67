use colored::Colorize;

use crate::core::error::{AgentError, Result};
use crate::core::style;

const DEFAULT_DRIVER: &str = "claude";

/// Scaffold a new agent file: `mdflow create <name> [driver]`.
pub fn run(args: &[String]) -> Result<()> {
    let Some(name) = args.first() else {
        return Err(AgentError::Configuration(
            "usage: mdflow create <name> [driver]".to_string(),
        ));
    };
    let driver = args
        .get(1)
        .map(String::as_str)
        .unwrap_or(DEFAULT_DRIVER);

    let filename = if name.ends_with(".md") {
        name.clone()
    } else {
        format!("{name}.{driver}.md")
    };

    let path = std::env::current_dir()
        .map_err(|e| AgentError::Configuration(format!("cannot read cwd: {e}")))?
        .join(&filename);
    if path.exists() {
        return Err(AgentError::Configuration(format!(
            "{filename} already exists"
        )));
    }

    let scaffold = format!(
        "---\n\
         # Keys here become driver flags; `_`-prefixed keys are template\n\
         # variable defaults. See `mdflow help` for the full vocabulary.\n\
         # model: opus\n\
         _task: \"{{{{ _1 | default: 'describe the task' }}}}\"\n\
         ---\n\
         \n\
         # {name}\n\
         \n\
         {{{{ _task }}}}\n"
    );

    std::fs::write(&path, scaffold).map_err(|e| AgentError::from_io(&path, e))?;

    eprintln!("{}", style::success(&format!("Created {filename}")));
    eprintln!();
    eprintln!("{}", "Next steps:".bold());
    eprintln!("  1. Edit {} with your prompt", filename.cyan());
    eprintln!(
        "  2. Run {} to execute it",
        format!("mdflow {filename}").cyan()
    );
    eprintln!(
        "  3. Add {} to preview without spawning {}",
        "--_dry-run".cyan(),
        driver
    );
    Ok(())
}
