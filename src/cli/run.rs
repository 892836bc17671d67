use std::collections::{BTreeMap, BTreeSet};
use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use serde_yaml::Mapping;

use crate::adapters;
use crate::cli::logs;
use crate::core::cancel::CancelToken;
use crate::core::compiler;
use crate::core::config;
use crate::core::dashboard::Dashboard;
use crate::core::directive::has_directives;
use crate::core::document::{Document, scalar_to_string};
use crate::core::driver::{CommandPlan, CurrentChild, install_signal_handlers, spawn_driver};
use crate::core::error::{AgentError, Result};
use crate::core::globber::GlobLimits;
use crate::core::remote::{self, RemoteAgent};
use crate::core::resolver::{ResolveOptions, Resolver};
use crate::core::style;
use crate::core::template::{Template, TmplValue, VarMap, yaml_to_value};
use crate::core::tokens;
use crate::core::vars;

/// Top-level agent flow: read, parse, resolve the driver, compile config,
/// expand imports, render the template, spawn the driver, relay its exit
/// code.
pub async fn run(target: &str, raw_args: &[String]) -> Result<i32> {
    let parsed = vars::parse_remaining_args(raw_args);
    let cwd = std::env::current_dir()
        .map_err(|e| AgentError::Configuration(format!("cannot read cwd: {e}")))?;

    let cancel = CancelToken::new();
    let current = CurrentChild::new();
    let signal_code = Arc::new(AtomicI32::new(130));
    install_signal_handlers(cancel.clone(), current.clone(), signal_code.clone());

    let client = reqwest::Client::new();

    // Resolve the agent file, fetching remote URLs through the cache
    let remote_agent = if remote::is_url(target) {
        Some(remote::fetch_remote_agent(&client, target, parsed.hijacked.no_cache).await?)
    } else {
        None
    };
    let file_path = match &remote_agent {
        Some(remote) => remote.local_path.clone(),
        None => find_agent_file(target, &cwd)?,
    };

    let raw = std::fs::read_to_string(&file_path)
        .map_err(|e| AgentError::from_io(&file_path, e))?;
    let doc = Document::parse(&raw)?;

    // The driver: CLI override wins, else the filename names it
    let agent_name = agent_file_name(target, remote_agent.as_ref());
    let driver_name = match parsed.hijacked.command.clone() {
        Some(name) => name,
        None => driver_from_filename(&agent_name).ok_or_else(|| {
            AgentError::Configuration(format!(
                "cannot determine driver from `{agent_name}` \
                 (expected <name>.<driver>.md, or pass --_command <driver>)"
            ))
        })?,
    };

    // Config cascade + front matter on top
    let cascade = config::load_cascade(&cwd, adapters::builtin_layer());
    let defaults = config::command_defaults(&cascade, &driver_name);
    let mut merged = overlay(&defaults, &doc.config);

    // Interactive-mode transform
    let interactive = filename_interactive(&agent_name)
        || vars::config_interactive(&merged)
        || parsed.hijacked.interactive;
    if interactive {
        let adapter = adapters::adapter_for(&driver_name);
        merged = adapter.apply_interactive(merged);
        merged.remove("_interactive");
        merged.remove("_i");
    }

    // Environment additions from the `env` mapping form
    let env = compiler::env_additions(&merged);

    // Variable binding set
    let stdin_input = read_piped_stdin()?;
    let mut bindings = vars::build_bindings(&merged, &parsed, stdin_input);
    let mut render_vars = assemble_render_vars(&merged, &bindings);

    // Expand directives
    let file_dir = file_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());
    let invocation_cwd = parsed
        .hijacked
        .cwd
        .clone()
        .or_else(|| merged.get("_cwd").and_then(scalar_to_string).map(PathBuf::from));

    let dashboard = Dashboard::new();
    let ticker = dashboard.spawn_ticker(cancel.clone());
    let resolver = Resolver::new(
        ResolveOptions {
            dry_run: parsed.hijacked.dry_run,
            invocation_cwd,
            env: env.clone(),
            tool_name: tool_name(),
            vars: Arc::new(render_vars.clone()),
            glob_limits: GlobLimits {
                context_limit: tokens::resolve_context_limit(context_window_override(&merged)),
                force_context: tokens::force_context(),
            },
        },
        cancel.clone(),
        dashboard.clone(),
    );

    let body = if has_directives(&doc.body) {
        let canonical = std::fs::canonicalize(&file_path).unwrap_or(file_path.clone());
        resolver
            .expand(doc.body.clone(), file_dir, vec![canonical])
            .await?
    } else {
        doc.body.clone()
    };

    ticker.abort();
    dashboard.clear();
    if cancel.is_cancelled() {
        return Ok(signal_code.load(Ordering::SeqCst));
    }

    // Free-variable analysis; `_`-prefixed unbound variables are prompted
    // for on a terminal and fatal otherwise
    let template = Template::parse(&body)?;
    let consumed: BTreeSet<String> = template.free_variables();
    let missing: Vec<String> = consumed
        .iter()
        .filter(|name| name.starts_with('_') && !bindings.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        if std::io::stdin().is_terminal() {
            for name in &missing {
                let value = prompt_line(&format!("{name}: "))?;
                bindings.insert(name.clone(), value.clone());
                render_vars.insert(name.clone(), TmplValue::Str(value));
            }
        } else {
            return Err(AgentError::Template(format!(
                "missing template variables: {} \
                 (pass --_<name> <value> or run on a terminal)",
                missing.join(", ")
            )));
        }
    }

    let rendered = template.render(&render_vars);

    // Compile argv; the rendered body is driver positional #1
    let compiled = compiler::compile(&merged, &consumed, &[rendered.clone()]);
    let argv = compiled.into_argv(&parsed.passthrough);
    let plan = CommandPlan {
        driver: driver_name.clone(),
        argv,
        env,
    };

    if parsed.hijacked.dry_run {
        print_dry_run(&plan, &rendered, &resolver.resolved_imports());
        return Ok(0);
    }

    // Trust-on-first-use for remote agents
    if let Some(remote) = &remote_agent {
        ensure_trusted(remote, parsed.hijacked.trust)?;
    }

    let code = spawn_driver(&plan, &current, &cancel).await?;
    logs::append_invocation(&agent_name, &driver_name, code);

    if cancel.is_cancelled() {
        return Ok(signal_code.load(Ordering::SeqCst));
    }
    Ok(code)
}

// ---------- Agent file resolution ----------

/// Search order for a bare name: as given, `<cwd>/.mdflow/<name>`,
/// `<home>/.mdflow/<name>`, then every entry on PATH.
fn find_agent_file(target: &str, cwd: &Path) -> Result<PathBuf> {
    let direct = cwd.join(target);
    if direct.is_file() {
        return Ok(direct);
    }

    let bare = !target.contains(std::path::MAIN_SEPARATOR) && !target.contains('/');
    if bare {
        let local = cwd.join(".mdflow").join(target);
        if local.is_file() {
            return Ok(local);
        }
        if let Some(home) = dirs::home_dir() {
            let user = home.join(".mdflow").join(target);
            if user.is_file() {
                return Ok(user);
            }
        }
        if let Some(path_var) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let candidate = dir.join(target);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    Err(AgentError::FileNotFound(PathBuf::from(target)))
}

fn agent_file_name(target: &str, remote: Option<&RemoteAgent>) -> String {
    let source = match remote {
        Some(r) => r
            .url
            .split('/')
            .next_back()
            .unwrap_or(r.url.as_str())
            .to_string(),
        None => target.to_string(),
    };
    Path::new(&source)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(source)
}

/// The driver is the segment between the final two dots before `.md`:
/// `fix.i.claude.md` resolves to `claude`, `task.claude.md` to `claude`.
pub fn driver_from_filename(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 || *parts.last()? != "md" {
        return None;
    }
    let driver = parts[parts.len() - 2];
    if driver.is_empty() || driver == "i" {
        return None;
    }
    Some(driver.to_string())
}

pub fn filename_interactive(name: &str) -> bool {
    name.contains(".i.")
}

// ---------- Config plumbing ----------

/// Front matter wins over defaults, key by key.
fn overlay(defaults: &Mapping, front: &Mapping) -> Mapping {
    let mut out = defaults.clone();
    for (k, v) in front {
        out.insert(k.clone(), v.clone());
    }
    out
}

fn context_window_override(config: &Mapping) -> Option<usize> {
    config
        .get("context_window")
        .and_then(serde_yaml::Value::as_u64)
        .map(|n| n as usize)
}

/// Template data: every merged config key (minus `$`-mappings) plus the
/// string bindings on top.
fn assemble_render_vars(config: &Mapping, bindings: &BTreeMap<String, String>) -> VarMap {
    let mut vars = VarMap::new();
    for (key, value) in config {
        let Some(key) = key.as_str() else { continue };
        if key.starts_with('$') {
            continue;
        }
        vars.insert(key.to_string(), yaml_to_value(value));
    }
    for (key, value) in bindings {
        vars.insert(key.clone(), TmplValue::Str(value.clone()));
    }
    vars
}

// ---------- I/O edges ----------

fn read_piped_stdin() -> Result<Option<String>> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let cap = tokens::MAX_INPUT_SIZE as usize;
    let mut buf = Vec::new();
    let read = stdin
        .lock()
        .take(cap as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(|e| AgentError::Import(format!("reading stdin: {e}")))?;
    if read > cap {
        return Err(AgentError::FileSizeLimit {
            path: PathBuf::from("<stdin>"),
            size: read as u64,
            limit: tokens::MAX_INPUT_SIZE,
        });
    }
    if buf.is_empty() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf)
        .trim_end_matches('\n')
        .to_string();
    Ok(Some(text))
}

fn prompt_line(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|_| AgentError::UserCancelled)?;
    if line.is_empty() {
        // EOF mid-prompt
        return Err(AgentError::UserCancelled);
    }
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

fn ensure_trusted(remote: &RemoteAgent, trust_flag: bool) -> Result<()> {
    if remote::is_trusted(&remote.host) || trust_flag {
        if trust_flag && !remote::is_trusted(&remote.host) {
            remote::trust(&remote.host)?;
        }
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        return Err(AgentError::Security(format!(
            "domain `{}` is not trusted; rerun with --_trust to allow it",
            remote.host
        )));
    }
    let answer = prompt_line(&format!(
        "Run agent from untrusted domain `{}`? [y/N] ",
        remote.host
    ))?;
    if answer.trim().eq_ignore_ascii_case("y") {
        remote::trust(&remote.host)?;
        Ok(())
    } else {
        Err(AgentError::UserCancelled)
    }
}

fn tool_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mdflow".to_string())
}

fn print_dry_run(plan: &CommandPlan, prompt: &str, imports: &[String]) {
    eprintln!("{}", style::header("Dry Run"));
    eprintln!("{}", style::detail("Driver", &plan.driver));
    eprintln!(
        "{}",
        style::detail("Command", &format!("{} {}", plan.driver, shell_join(&plan.argv)))
    );
    eprintln!(
        "{}",
        style::detail("Tokens", &format!("~{}", tokens::estimate_tokens(prompt)))
    );
    if !imports.is_empty() {
        eprintln!("{}", style::detail("Imports", &imports.join(", ")));
    }
    eprintln!();
    println!("{prompt}");
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.contains(char::is_whitespace) || a.is_empty() {
                format!("\"{}\"", a.replace('"', "\\\""))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_from_filename() {
        assert_eq!(driver_from_filename("task.claude.md").as_deref(), Some("claude"));
        assert_eq!(driver_from_filename("fix.i.claude.md").as_deref(), Some("claude"));
        assert_eq!(driver_from_filename("a.b.codex.md").as_deref(), Some("codex"));
        assert_eq!(driver_from_filename("task.md"), None);
        assert_eq!(driver_from_filename("README"), None);
        assert_eq!(driver_from_filename("fix.i.md"), None);
    }

    #[test]
    fn test_filename_interactive() {
        assert!(filename_interactive("fix.i.claude.md"));
        assert!(!filename_interactive("fix.claude.md"));
        assert!(!filename_interactive("institute.claude.md"));
    }

    #[test]
    fn test_overlay_front_matter_wins() {
        let defaults: Mapping = serde_yaml::from_str("print: true\nmodel: opus\n").unwrap();
        let front: Mapping = serde_yaml::from_str("model: sonnet\n").unwrap();
        let merged = overlay(&defaults, &front);
        assert_eq!(
            merged.get("model"),
            Some(&serde_yaml::Value::String("sonnet".into()))
        );
        assert_eq!(merged.get("print"), Some(&serde_yaml::Value::Bool(true)));
    }

    #[test]
    fn test_assemble_render_vars_layers() {
        let config: Mapping =
            serde_yaml::from_str("model: opus\n$1: prompt\nnested:\n  key: v\n").unwrap();
        let mut bindings = BTreeMap::new();
        bindings.insert("_1".to_string(), "hola".to_string());
        let vars = assemble_render_vars(&config, &bindings);

        assert_eq!(vars.get("model"), Some(&TmplValue::Str("opus".to_string())));
        assert_eq!(vars.get("_1"), Some(&TmplValue::Str("hola".to_string())));
        assert!(!vars.contains_key("$1"));
        assert!(matches!(vars.get("nested"), Some(TmplValue::Map(_))));
    }

    #[test]
    fn test_shell_join_quotes_spaces() {
        let argv = vec!["--print".to_string(), "Say hi.".to_string()];
        assert_eq!(shell_join(&argv), "--print \"Say hi.\"");
    }

    #[test]
    fn test_context_window_override() {
        let config: Mapping = serde_yaml::from_str("context_window: 9000\n").unwrap();
        assert_eq!(context_window_override(&config), Some(9000));
        assert_eq!(context_window_override(&Mapping::new()), None);
    }

    #[test]
    fn test_find_agent_file_direct() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("t.claude.md"), "body").unwrap();
        let found = find_agent_file("t.claude.md", tmp.path()).unwrap();
        assert_eq!(found, tmp.path().join("t.claude.md"));
    }

    #[test]
    fn test_find_agent_file_project_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".mdflow")).unwrap();
        std::fs::write(tmp.path().join(".mdflow/t.claude.md"), "body").unwrap();
        let found = find_agent_file("t.claude.md", tmp.path()).unwrap();
        assert_eq!(found, tmp.path().join(".mdflow/t.claude.md"));
    }

    #[test]
    fn test_find_agent_file_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = find_agent_file("nope.claude.md", tmp.path()).unwrap_err();
        assert!(matches!(err, AgentError::FileNotFound(_)));
    }
}
