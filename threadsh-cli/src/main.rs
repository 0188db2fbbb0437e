//! threadsh - interactive shell for threads databases
//!
//! Entry point for the `threadsh` binary:
//! - The shell itself (default, or `threadsh shell`)
//! - Config file management (`config` subcommand)
//! - Shell completion scripts (`completions` subcommand)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use threadsh_core::config::ModeName;
use threadsh_core::{ClientMode, ThreadshConfig};
use tracing::debug;

mod config;
mod repl;
mod tracing_setup;
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "threadsh",
    author,
    version,
    about = "Interactive shell for threads databases",
    long_about = "Create and reuse named stores, register collections and run model \
                  operations against a local threads daemon, the cloud gateway, or an \
                  embedded in-process backend."
)]
struct Cli {
    /// Suppress spinners (for scripts and piped input)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Debug logging to stderr (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    /// Config file to read instead of ~/.threadsh/config.toml
    #[arg(long = "config", global = true, value_name = "PATH", env = "THREADSH_CONFIG")]
    config_path: Option<PathBuf>,

    #[command(flatten)]
    shell: ShellArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the interactive shell (the default)
    Shell,
    /// Manage threadsh configuration (init, get, show, path)
    Config(config::ConfigArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
struct ShellArgs {
    /// Authenticate to the cloud gateway with this token at startup
    #[arg(long = "project-token")]
    project_token: Option<String>,

    /// Store to use at startup (created unless --project-db-id is given)
    #[arg(long = "project-db-name")]
    project_db_name: Option<String>,

    /// Existing store id to resume as --project-db-name
    #[arg(long = "project-db-id", requires = "project_db_name")]
    project_db_id: Option<String>,

    /// Threads API address (overrides client.host)
    #[arg(long)]
    host: Option<String>,

    /// Use the in-process backend instead of a daemon
    #[arg(long, conflicts_with = "host")]
    embedded: bool,

    /// Per-call deadline in seconds (overrides client.timeout_secs)
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    ui::init_quiet_mode(cli.quiet);
    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug })?;

    let config_path = cli
        .config_path
        .unwrap_or_else(ThreadshConfig::config_path);

    match cli.command {
        Some(Commands::Config(args)) => config::run_config(args, &config_path),
        Some(Commands::Completions(args)) => run_completions(args),
        Some(Commands::Shell) | None => {
            let status = run_shell(cli.shell, &config_path).await?;
            std::process::exit(status);
        }
    }
}

/// File config with command-line overrides applied
fn effective_config(args: &ShellArgs, config_path: &Path) -> Result<ThreadshConfig> {
    let mut config =
        ThreadshConfig::load_or_default(config_path).context("failed to load config")?;
    if let Some(host) = &args.host {
        config.client.host = host.clone();
        if config.client.mode == ModeName::Embedded {
            config.client.mode = ModeName::Local;
        }
    }
    if args.embedded {
        config.client.mode = ModeName::Embedded;
    }
    if let Some(secs) = args.timeout {
        config.client.timeout_secs = secs;
    }
    Ok(config)
}

async fn run_shell(args: ShellArgs, config_path: &Path) -> Result<i32> {
    let config = effective_config(&args, config_path)?;
    // A bare `auth` in cloud mode without a token falls back to the daemon
    let mode = config.client_mode().unwrap_or_else(|_| ClientMode::Local {
        host: config.client.host.clone(),
    });
    debug!(?mode, "starting shell");

    let prompt = config.shell.prompt.clone();
    let (mut session, notices) = repl::Session::new(config, mode);

    match session
        .bootstrap(args.project_token, args.project_db_name, args.project_db_id)
        .await
    {
        Ok(replies) => {
            for reply in replies {
                if let Some(status) = repl::render(reply) {
                    return Ok(status);
                }
            }
        }
        Err(e) => ui::say_error(&format!("{:#}", e)),
    }

    repl::run(session, notices, &prompt).await
}

fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_project_db_id_requires_name() {
        let parsed = Cli::try_parse_from(["threadsh", "--project-db-id", "abc"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "threadsh",
            "--project-db-name",
            "people",
            "--project-db-id",
            "abc",
        ])
        .unwrap();
        assert_eq!(parsed.shell.project_db_id.as_deref(), Some("abc"));
        assert!(parsed.command.is_none());
    }

    #[test]
    fn test_embedded_overrides_mode() {
        let args = ShellArgs {
            embedded: true,
            timeout: Some(5),
            ..ShellArgs::default()
        };
        let missing = Path::new("/nonexistent/threadsh-test.toml");
        let config = effective_config(&args, missing).unwrap();
        assert_eq!(config.client.mode, ModeName::Embedded);
        assert_eq!(config.client.timeout_secs, 5);
    }

    #[test]
    fn test_config_flag_selects_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[client]\nhost = \"http://10.0.0.7:6007\"\ntimeout_secs = 9\n",
        )
        .unwrap();

        let parsed = Cli::try_parse_from(["threadsh", "--config", path.to_str().unwrap()]).unwrap();
        let config_path = parsed.config_path.unwrap();
        let config = effective_config(&parsed.shell, &config_path).unwrap();

        assert_eq!(config.client.host, "http://10.0.0.7:6007");
        assert_eq!(config.client.timeout_secs, 9);
    }
}
