use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use threadsh_core::config::ModeName;
use threadsh_core::ThreadshConfig;

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write a config file with default values
    Init(InitArgs),
    /// Get a config value by dot-notation key (e.g. "client.host")
    Get(GetArgs),
    /// Print the effective config as TOML (token masked)
    Show,
    /// Show config file path
    Path,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum InitMode {
    Local,
    Cloud,
    Embedded,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Client mode to write
    #[arg(long, value_enum, default_value = "local")]
    pub mode: InitMode,

    /// Threads API address to write
    #[arg(long)]
    pub host: Option<String>,

    /// Force overwrite existing config
    #[arg(long, short)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Dot-notation key (e.g., "client.timeout_secs")
    pub key: String,
}

pub fn run_config(args: ConfigArgs, config_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommands::Init(args) => run_init(args, config_path),
        ConfigCommands::Get(args) => run_get(args, config_path),
        ConfigCommands::Show => run_show(config_path),
        ConfigCommands::Path => run_path(config_path),
    }
}

fn run_init(args: InitArgs, config_path: &Path) -> Result<()> {

    if config_path.exists() && !args.force {
        return Err(anyhow!(
            "Config already exists at {:?}\n\nUse --force to overwrite",
            config_path
        ));
    }

    let mut config = ThreadshConfig::default();
    config.client.mode = match args.mode {
        InitMode::Local => ModeName::Local,
        InitMode::Cloud => ModeName::Cloud,
        InitMode::Embedded => ModeName::Embedded,
    };
    if let Some(host) = args.host {
        config.client.host = host;
    }
    if matches!(config.client.mode, ModeName::Cloud) {
        config.client.token = Some("${THREADS_TOKEN}".to_string());
    }

    config
        .save_to(config_path)
        .context(format!("Failed to write config file: {:?}", config_path))?;

    println!("Created config at: {:?}", config_path);
    if matches!(config.client.mode, ModeName::Cloud) {
        println!("Set THREADS_TOKEN in your environment, or edit client.token");
    }

    Ok(())
}

fn run_get(args: GetArgs, config_path: &Path) -> Result<()> {
    let config = ThreadshConfig::load_or_default(config_path)?;
    println!("{}", get_config_value(&config, &args.key)?);
    Ok(())
}

fn run_show(config_path: &Path) -> Result<()> {
    let mut config = ThreadshConfig::load_or_default(config_path)?;
    if let Some(token) = config.client.token.as_mut() {
        *token = mask(token);
    }

    let toml_str = toml::to_string_pretty(&config).context("Failed to serialize config to TOML")?;
    println!("{}", toml_str);
    Ok(())
}

fn run_path(config_path: &Path) -> Result<()> {
    println!("{}", config_path.display());
    Ok(())
}

fn mask(secret: &str) -> String {
    match secret.char_indices().nth(4) {
        Some((cut, _)) => format!("{}****", &secret[..cut]),
        None => "****".to_string(),
    }
}

fn get_config_value(config: &ThreadshConfig, key: &str) -> Result<String> {
    let client = &config.client;
    match key {
        "client.mode" => Ok(match client.mode {
            ModeName::Local => "local",
            ModeName::Cloud => "cloud",
            ModeName::Embedded => "embedded",
        }
        .to_string()),
        "client.host" => Ok(client.host.clone()),
        "client.token" => client
            .token
            .as_deref()
            .map(mask)
            .ok_or_else(|| anyhow!("client.token not set")),
        "client.device_id" => client
            .device_id
            .clone()
            .ok_or_else(|| anyhow!("client.device_id not set")),
        "client.timeout_secs" => Ok(client.timeout_secs.to_string()),
        "shell.prompt" => Ok(config.shell.prompt.clone()),
        _ => Err(anyhow!("Unknown config key: {}", key)),
    }
}
