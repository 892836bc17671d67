pub mod create;
pub mod logs;
pub mod run;
pub mod setup;

use clap::{CommandFactory, Parser};

use crate::core::error::AgentError;
use crate::core::style;

#[derive(Parser)]
#[command(name = "mdflow")]
#[command(about = "Run markdown files as AI-agent scripts — front matter becomes argv, the body becomes the prompt")]
#[command(version)]
pub struct Cli {
    /// Agent file, URL, or subcommand (create, setup, logs, help)
    pub target: Option<String>,

    /// Flags and positionals interpreted by the agent pipeline
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// Run to completion, reporting failures, and return the process exit
    /// code.
    pub async fn run(self) -> i32 {
        match self.dispatch().await {
            Ok(code) => code,
            Err(AgentError::EarlyExit) => 0,
            Err(err) => {
                eprintln!("{}", style::failure(&err.to_string()));
                if std::io::IsTerminal::is_terminal(&std::io::stderr())
                    && let Some(path) = logs::last_log_path()
                {
                    eprintln!("{}", style::hint(&format!("details: {}", path.display())));
                }
                err.exit_code()
            }
        }
    }

    async fn dispatch(self) -> crate::core::error::Result<i32> {
        let Some(target) = self.target else {
            // The interactive file picker is an external concern; without a
            // terminal there is nothing to pick from.
            return Err(AgentError::Configuration(
                "no agent file given (usage: mdflow <file|url> [args...])".to_string(),
            ));
        };

        match target.as_str() {
            "create" => {
                create::run(&self.args)?;
                Ok(0)
            }
            "setup" => {
                setup::run()?;
                Ok(0)
            }
            "logs" => {
                logs::run(&self.args)?;
                Ok(0)
            }
            "help" => {
                let mut command = Cli::command();
                let _ = command.print_help();
                Ok(0)
            }
            _ => run::run(&target, &self.args).await,
        }
    }
}

/// Tracing setup: `DEBUG` / `MA_DEBUG` turn on debug-level logging.
pub fn init_logging() {
    let debug = ["DEBUG", "MA_DEBUG"]
        .iter()
        .any(|name| std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0"));
    let filter = if debug { "mdflow=debug" } else { "mdflow=warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}
