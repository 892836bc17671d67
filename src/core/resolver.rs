use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::core::cancel::CancelToken;
use crate::core::dashboard::Dashboard;
use crate::core::directive::{Directive, Spanned, parse_directives};
use crate::core::error::{AgentError, Result};
use crate::core::exec::{ExecContext, run_code_fence, run_inline_command};
use crate::core::fetch::fetch_url;
use crate::core::globber::{GlobLimits, expand_glob, expand_home, is_binary_file};
use crate::core::symbol::extract_symbol;
use crate::core::template::VarMap;
use crate::core::tokens::MAX_INPUT_SIZE;

/// Concurrent directive resolutions per document tree.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Knobs shared by every directive resolution in one invocation.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub dry_run: bool,
    /// `_cwd` override for inline commands; defaults to the containing
    /// file's directory
    pub invocation_cwd: Option<PathBuf>,
    /// Environment additions for inline commands and fences
    pub env: Vec<(String, String)>,
    /// The outer tool's name, for recursive markdown commands
    pub tool_name: String,
    /// Current template bindings, visible to inline command text
    pub vars: Arc<VarMap>,
    pub glob_limits: GlobLimits,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            dry_run: false,
            invocation_cwd: None,
            env: Vec::new(),
            tool_name: "mdflow".to_string(),
            vars: Arc::new(VarMap::new()),
            glob_limits: GlobLimits::default(),
        }
    }
}

/// Three-phase import resolver: parse the body into directives, resolve
/// each concurrently under a bounded semaphore, then inject replacements in
/// descending index order so earlier offsets stay valid.
pub struct Resolver {
    opts: ResolveOptions,
    semaphore: Arc<Semaphore>,
    client: reqwest::Client,
    cancel: CancelToken,
    dashboard: Dashboard,
    tracker: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl Resolver {
    pub fn new(opts: ResolveOptions, cancel: CancelToken, dashboard: Dashboard) -> Self {
        Resolver {
            opts,
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            client: reqwest::Client::new(),
            cancel,
            dashboard,
            tracker: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The logical paths/URLs resolved so far, in completion order.
    /// Debug/dry-run introspection only.
    pub fn resolved_imports(&self) -> Vec<String> {
        self.tracker.lock().expect("tracker lock").clone()
    }

    /// Expand every directive in `body`. `base` is the directory imports
    /// resolve against; `stack` is the chain of canonical file paths
    /// currently being expanded, used for cycle detection.
    pub fn expand<'a>(
        &'a self,
        body: String,
        base: PathBuf,
        stack: Vec<PathBuf>,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            let directives = parse_directives(&body);
            if directives.is_empty() {
                return Ok(body);
            }

            let futures = directives
                .into_iter()
                .map(|d| self.resolve_one(d, base.clone(), stack.clone()));
            let mut resolved = futures::future::try_join_all(futures).await?;

            // Splice in descending index order to preserve earlier offsets
            resolved.sort_by_key(|(index, _, _)| *index);
            let mut out = body;
            for (index, original_len, replacement) in resolved.into_iter().rev() {
                out.replace_range(index..index + original_len, &replacement);
            }
            Ok(out)
        }
        .boxed()
    }

    async fn resolve_one(
        &self,
        spanned: Spanned,
        base: PathBuf,
        stack: Vec<PathBuf>,
    ) -> Result<(usize, usize, String)> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::UserCancelled);
        }

        let index = spanned.index;
        let original_len = spanned.original.len();
        let replacement = match spanned.directive {
            Directive::File { path, line_range } => {
                self.resolve_file(&path, line_range, &base, stack).await?
            }
            Directive::Glob { pattern } => {
                let _permit = self.acquire().await?;
                expand_glob(&pattern, &base, &self.opts.glob_limits)?
            }
            Directive::Symbol { path, name } => {
                let _permit = self.acquire().await?;
                self.resolve_symbol(&path, &name, &base)?
            }
            Directive::Url { url } => {
                let _permit = self.acquire().await?;
                let body = fetch_url(&self.client, &url).await?;
                self.track(&url);
                body
            }
            Directive::Command { text } => {
                let _permit = self.acquire().await?;
                let ctx = self.exec_context(&base);
                run_inline_command(&text, &ctx).await?
            }
            Directive::ExecFence {
                info_string,
                shebang,
                code,
            } => {
                let _permit = self.acquire().await?;
                let ctx = self.exec_context(&base);
                run_code_fence(&info_string, &shebang, &code, &ctx).await?
            }
        };

        Ok((index, original_len, replacement))
    }

    async fn resolve_file(
        &self,
        path: &str,
        line_range: Option<(usize, usize)>,
        base: &Path,
        stack: Vec<PathBuf>,
    ) -> Result<String> {
        // Hold a permit for the I/O only; recursion below acquires its own
        let (canonical, content) = {
            let _permit = self.acquire().await?;
            let full = resolve_path(path, base);
            let canonical = canonicalize_checked(&full)?;

            if stack.contains(&canonical) {
                return Err(cycle_error(&stack, &canonical));
            }

            let size = std::fs::metadata(&canonical)
                .map_err(|e| AgentError::from_io(&canonical, e))?
                .len();
            if size > MAX_INPUT_SIZE {
                return Err(AgentError::FileSizeLimit {
                    path: canonical,
                    size,
                    limit: MAX_INPUT_SIZE,
                });
            }
            if is_binary_file(&canonical) {
                return Err(AgentError::BinaryFileImport(canonical));
            }

            let content = std::fs::read_to_string(&canonical)
                .map_err(|e| AgentError::from_io(&canonical, e))?;
            (canonical, content)
        };

        self.track(path);

        let content = match line_range {
            Some((start, end)) => slice_lines(&content, start, end),
            None => content,
        };

        // Recurse with the imported file's directory as the new base
        let new_base = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base.to_path_buf());
        let mut new_stack = stack;
        new_stack.push(canonical);
        self.expand(content, new_base, new_stack).await
    }

    fn resolve_symbol(&self, path: &str, name: &str, base: &Path) -> Result<String> {
        let full = resolve_path(path, base);
        let canonical = canonicalize_checked(&full)?;
        if is_binary_file(&canonical) {
            return Err(AgentError::BinaryFileImport(canonical));
        }
        let source = std::fs::read_to_string(&canonical)
            .map_err(|e| AgentError::from_io(&canonical, e))?;
        self.track(&format!("{path}#{name}"));
        extract_symbol(&source, name, &canonical)
    }

    fn exec_context(&self, base: &Path) -> ExecContext {
        ExecContext {
            cwd: self
                .opts
                .invocation_cwd
                .clone()
                .unwrap_or_else(|| base.to_path_buf()),
            env: self.opts.env.clone(),
            dry_run: self.opts.dry_run,
            cancel: self.cancel.clone(),
            dashboard: self.dashboard.clone(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tool_name: self.opts.tool_name.clone(),
            vars: Arc::clone(&self.opts.vars),
            timeout: crate::core::exec::COMMAND_TIMEOUT,
        }
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| AgentError::Import("resolver shut down".to_string()))
    }

    fn track(&self, logical: &str) {
        self.tracker
            .lock()
            .expect("tracker lock")
            .push(logical.to_string());
    }
}

fn resolve_path(path: &str, base: &Path) -> PathBuf {
    let expanded = expand_home(path);
    let p = Path::new(&expanded);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(target_os = "linux")]
const ELOOP: i32 = 40;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
const ELOOP: i32 = 62;

fn canonicalize_checked(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| {
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
        let is_loop = e.raw_os_error() == Some(ELOOP);
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly")))]
        let is_loop = false;

        if is_loop {
            AgentError::CircularImport {
                chain: format!("{0} -> {0}", display_name(path)),
            }
        } else {
            AgentError::from_io(path, e)
        }
    })
}

fn cycle_error(stack: &[PathBuf], repeated: &Path) -> AgentError {
    let mut names: Vec<String> = stack.iter().map(|p| display_name(p)).collect();
    names.push(display_name(repeated));
    AgentError::CircularImport {
        chain: names.join(" -> "),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// 1-indexed inclusive line slice, clamped to the file.
fn slice_lines(content: &str, start: usize, end: usize) -> String {
    let from = start.saturating_sub(1);
    let count = end.saturating_sub(from);
    content
        .lines()
        .skip(from)
        .take(count)
        .collect::<Vec<_>>()
        .join("\n")
}
