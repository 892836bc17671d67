use std::path::PathBuf;

use chrono::Utc;
use colored::Colorize;

use crate::core::error::{AgentError, Result};
use crate::core::style;

const TAIL_LINES: usize = 20;

/// Show per-agent debug logs: `mdflow logs [agent-name]`.
pub fn run(args: &[String]) -> Result<()> {
    let Some(logs_dir) = logs_dir() else {
        return Err(AgentError::Configuration(
            "cannot locate home directory".to_string(),
        ));
    };

    match args.first() {
        Some(name) => {
            let path = logs_dir.join(agent_slug(name)).join("debug.log");
            let content = std::fs::read_to_string(&path)
                .map_err(|e| AgentError::from_io(&path, e))?;
            eprintln!("{}", style::detail("Log", &path.display().to_string()));
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(TAIL_LINES);
            for line in &lines[start..] {
                println!("{line}");
            }
        }
        None => {
            let entries = std::fs::read_dir(&logs_dir)
                .map_err(|e| AgentError::from_io(&logs_dir, e))?;
            let mut agents: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            agents.sort();
            if agents.is_empty() {
                eprintln!("No agent logs yet.");
                return Ok(());
            }
            eprintln!("{}", "Agents with logs:".bold());
            for agent in agents {
                eprintln!("  {agent}");
            }
            eprintln!();
            eprintln!("Run {} to tail one.", "mdflow logs <agent>".cyan());
        }
    }
    Ok(())
}

/// Append one invocation record to the agent's debug log. Logging failures
/// never fail the run.
pub fn append_invocation(agent_name: &str, driver: &str, exit_code: i32) {
    let Some(dir) = logs_dir().map(|d| d.join(agent_slug(agent_name))) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let line = format!(
        "{} driver={driver} exit={exit_code}\n",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );
    let path = dir.join("debug.log");
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        && file.write_all(line.as_bytes()).is_err()
    {
        tracing::debug!("failed to append {}", path.display());
    }
}

/// The most recently touched debug log, for the failure hint.
pub fn last_log_path() -> Option<PathBuf> {
    let dir = logs_dir()?;
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).ok()?.filter_map(|e| e.ok()) {
        let log = entry.path().join("debug.log");
        let Ok(meta) = std::fs::metadata(&log) else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, log));
        }
    }
    newest.map(|(_, path)| path)
}

fn logs_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mdflow").join("logs"))
}

/// Slug for the per-agent log directory: the filename up to the first dot,
/// lowercased, non-alphanumeric runs collapsed to `-`.
pub fn agent_slug(name: &str) -> String {
    let stem = name.split('.').next().unwrap_or(name);
    let mut slug = String::new();
    let mut pending = false;
    for c in stem.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending && !slug.is_empty() {
                slug.push('-');
            }
            pending = false;
            slug.push(c);
        } else {
            pending = true;
        }
    }
    if slug.is_empty() {
        "agent".to_string()
    } else {
        slug
    }
}
