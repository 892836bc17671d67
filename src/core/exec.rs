use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::core::cancel::CancelToken;
use crate::core::dashboard::Dashboard;
use crate::core::error::{AgentError, Result};
use crate::core::template::{VarMap, render_lenient};
use crate::core::tokens::MAX_COMMAND_OUTPUT;

/// Per-command wall-clock cap.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw bytes kept from a child's stdout before character truncation.
const STDOUT_BYTE_CAP: usize = 1024 * 1024;

/// Shared context for one inline command or executable fence.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Working directory: the invocation `_cwd` if set, else the containing
    /// file's directory
    pub cwd: PathBuf,
    /// Environment additions on top of the inherited process env
    pub env: Vec<(String, String)>,
    pub dry_run: bool,
    pub cancel: CancelToken,
    pub dashboard: Dashboard,
    /// Dashboard line id for this directive
    pub id: u64,
    /// The outer tool's own name, used to rerun markdown agents recursively
    pub tool_name: String,
    /// Current template bindings; command text may reference `{{ _name }}`
    pub vars: Arc<VarMap>,
    /// Overridable for tests; defaults to [`COMMAND_TIMEOUT`]
    pub timeout: Duration,
}

impl ExecContext {
    pub fn new(cwd: PathBuf) -> Self {
        ExecContext {
            cwd,
            env: Vec::new(),
            dry_run: false,
            cancel: CancelToken::new(),
            dashboard: Dashboard::disabled(),
            id: 0,
            tool_name: "mdflow".to_string(),
            vars: Arc::new(VarMap::new()),
            timeout: COMMAND_TIMEOUT,
        }
    }
}

/// Run an inline `` !`…` `` command through the platform shell.
pub async fn run_inline_command(text: &str, ctx: &ExecContext) -> Result<String> {
    // The command string may itself use template variables
    let substituted = render_lenient(text.trim(), &ctx.vars);

    // Markdown-file command syntax reruns a markdown agent recursively
    let command = if is_markdown_command(&substituted) {
        format!("{} {}", ctx.tool_name, substituted)
    } else {
        substituted
    };

    tracing::info!(command = %command, "inline command");

    if ctx.dry_run {
        return Ok(wrap_raw(&format!(
            "[Dry Run: Command \"{command}\" not executed]"
        )));
    }

    ctx.dashboard.register(ctx.id, &command);
    let mut cmd = shell_command(&command);
    cmd.current_dir(&ctx.cwd)
        .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let result = run_captured(cmd, ctx).await;
    ctx.dashboard.finish(ctx.id);
    let captured = result?;

    finish_command(&command, captured, false)
}

/// Run an executable code fence: write the shebang script to a temporary
/// file, mark it executable, and spawn it directly. The file is deleted on
/// exit, success or failure.
pub async fn run_code_fence(
    language: &str,
    shebang: &str,
    code: &str,
    ctx: &ExecContext,
) -> Result<String> {
    tracing::info!(language, shebang, "executable code fence");

    if ctx.dry_run {
        return Ok(wrap_raw("[Dry Run: Code fence not executed]"));
    }

    let ext = extension_for(language);
    let script = tempfile::Builder::new()
        .prefix("mdflow-fence-")
        .suffix(&format!(".{ext}"))
        .tempfile()
        .map_err(|e| AgentError::CodeFenceFailed(format!("temp file: {e}")))?;

    let contents = format!("{shebang}\n{code}\n");
    std::fs::write(script.path(), contents)
        .map_err(|e| AgentError::CodeFenceFailed(format!("write script: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(script.path(), std::fs::Permissions::from_mode(0o755))
            .map_err(|e| AgentError::CodeFenceFailed(format!("chmod script: {e}")))?;
    }

    // Drop the open write handle before exec: some kernels refuse to run a
    // file that still has a writable fd open on it (ETXTBSY). `into_temp_path`
    // keeps the file on disk (and still removes it on drop) without holding
    // it open.
    let script = script.into_temp_path();

    let preview = format!("{shebang} ({language})");
    ctx.dashboard.register(ctx.id, &preview);

    let mut cmd = Command::new(&script);
    cmd.current_dir(&ctx.cwd)
        .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let result = run_captured(cmd, ctx).await;
    ctx.dashboard.finish(ctx.id);
    let captured = result?;

    // The temp file lives until here; dropping `script` removes it
    finish_command(&preview, captured, true)
}

// ---------- Process plumbing ----------

struct Captured {
    status: std::process::ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.args(["/d", "/s", "/c", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

async fn run_captured(mut cmd: Command, ctx: &ExecContext) -> Result<Captured> {
    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::CommandFailed(format!("failed to spawn: {e}")))?;

    enum Outcome {
        Done(std::io::Result<Captured>),
        TimedOut,
        Cancelled,
    }

    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => Outcome::Cancelled,
        res = tokio::time::timeout(ctx.timeout, read_and_wait(&mut child, ctx)) => {
            match res {
                Ok(inner) => Outcome::Done(inner),
                Err(_) => Outcome::TimedOut,
            }
        }
    };

    match outcome {
        Outcome::Done(res) => {
            res.map_err(|e| AgentError::CommandFailed(format!("I/O failure: {e}")))
        }
        Outcome::TimedOut => {
            kill(&mut child).await;
            Err(AgentError::CommandFailed(format!(
                "timed out after {}s",
                ctx.timeout.as_secs()
            )))
        }
        Outcome::Cancelled => {
            kill(&mut child).await;
            Err(AgentError::UserCancelled)
        }
    }
}

async fn kill(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Stream stdout into a bounded buffer (forwarding chunks to the dashboard),
/// drain stderr, then reap the child.
async fn read_and_wait(child: &mut Child, ctx: &ExecContext) -> std::io::Result<Captured> {
    let mut out_pipe = child.stdout.take();
    let mut err_pipe = child.stderr.take();

    let out_fut = async {
        let mut buf = Vec::new();
        if let Some(pipe) = out_pipe.as_mut() {
            let mut chunk = [0u8; 8192];
            loop {
                let n = pipe.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                if buf.len() < STDOUT_BYTE_CAP {
                    buf.extend_from_slice(&chunk[..n]);
                }
                ctx.dashboard
                    .update(ctx.id, &String::from_utf8_lossy(&chunk[..n]));
            }
        }
        Ok::<_, std::io::Error>(buf)
    };
    let err_fut = async {
        let mut buf = Vec::new();
        if let Some(pipe) = err_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let (out_res, err_res) = tokio::join!(out_fut, err_fut);
    let status = child.wait().await?;

    Ok(Captured {
        status,
        stdout: out_res?,
        stderr: err_res?,
    })
}

fn finish_command(command: &str, captured: Captured, fence: bool) -> Result<String> {
    let fail = |msg: String| {
        if fence {
            AgentError::CodeFenceFailed(msg)
        } else {
            AgentError::CommandFailed(msg)
        }
    };

    // Binary stdout is never spliced into a prompt
    let probe = &captured.stdout[..captured.stdout.len().min(1024)];
    if probe.contains(&0) {
        return Err(fail(format!("`{command}` produced binary output")));
    }

    let stdout = strip_ansi(&String::from_utf8_lossy(&captured.stdout));
    let stderr = strip_ansi(&String::from_utf8_lossy(&captured.stderr));

    if !captured.status.success() {
        let code = captured
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        return Err(fail(format!("`{command}` exited with {code}: {detail}")));
    }

    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    let combined = match (stderr.is_empty(), stdout.is_empty()) {
        (false, false) => format!("{stderr}\n{stdout}"),
        (false, true) => stderr.to_string(),
        (true, _) => stdout.to_string(),
    };

    let sanitized = escape_endraw(&combined);
    Ok(wrap_raw(&truncate_output(&sanitized)))
}

// ---------- Output sanitization ----------

static CSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;:?]*[@-~]").unwrap());

static ENDRAW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{%-?\s*endraw\s*-?%\}").unwrap());

/// Strip ANSI escape sequences, regardless of consumer.
pub fn strip_ansi(text: &str) -> String {
    CSI_RE.replace_all(text, "").replace('\u{1b}', "")
}

/// Break up literal `{% endraw %}` so captured output cannot terminate the
/// raw wrapper it is placed in.
pub fn escape_endraw(text: &str) -> String {
    ENDRAW_RE.replace_all(text, "{ % endraw % }").into_owned()
}

/// Wrap resolved text so the template engine passes it through untouched.
pub fn wrap_raw(text: &str) -> String {
    format!("{{% raw %}}\n{text}\n{{% endraw %}}")
}

/// Cap at 100,000 characters with an explanatory suffix.
pub fn truncate_output(text: &str) -> String {
    if text.chars().count() <= MAX_COMMAND_OUTPUT {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_COMMAND_OUTPUT).collect();
    format!("{kept}\n[output truncated at {MAX_COMMAND_OUTPUT} characters]")
}

/// Markdown-file command syntax: the first token, with an optional `./`,
/// `../`, `~/`, or `/` prefix, ends with `.md`.
fn is_markdown_command(command: &str) -> bool {
    let Some(first) = command.split_whitespace().next() else {
        return false;
    };
    first.ends_with(".md") && !first.contains("://")
}

fn extension_for(language: &str) -> &str {
    match language {
        "ts" | "typescript" => "ts",
        "js" | "javascript" => "js",
        "py" | "python" => "py",
        "sh" | "shell" => "sh",
        "bash" => "bash",
        "" => "sh",
        other => other,
    }
}
