use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use tessera_core::{now_millis, Command, CommandType, KeyPair, SecretKey};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod node;

use cli::{Cli, Commands};
use config::{generate_sample_config, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_node(&config).await?,
        Commands::Init { output } => init_config(&output)?,
        Commands::Keygen { output } => generate_keypair(output)?,
        Commands::Status { endpoint } => show_status(&endpoint).await?,
        Commands::Submit { endpoint, file } => submit_command(&endpoint, &file).await?,
        Commands::Sign {
            key,
            file,
            block_number,
        } => sign_command(&key, &file, block_number)?,
    }

    Ok(())
}

async fn run_node(config_path: &Path) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    if !config_path.exists() {
        error!(
            "Configuration file not found: {:?}. Run 'tessera init' to create one.",
            config_path
        );
        bail!("Configuration file not found");
    }
    let config = NodeConfig::load(config_path)?;

    Node::new(config).await?.run().await
}

fn init_config(output: &Path) -> Result<()> {
    let config = generate_sample_config();
    config.save(output)?;

    println!("Configuration file created: {}", output.display());
    println!("Validator: {}", config.keypair()?.public.to_hex());
    println!("\nTo start the validator, run:");
    println!("  tessera run --config {}", output.display());

    Ok(())
}

fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    Ok(())
}

async fn show_status(endpoint: &str) -> Result<()> {
    let url = format!("{}/status", endpoint.trim_end_matches('/'));
    let response = reqwest::get(&url).await?;

    if response.status().is_success() {
        let status: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        error!("Failed to get status: {}", response.status());
    }

    Ok(())
}

async fn submit_command(endpoint: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    let cmd: Command = serde_json::from_str(&content)?;

    let url = format!("{}/commands", endpoint.trim_end_matches('/'));
    let response = reqwest::Client::new().post(&url).json(&cmd).send().await?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        error!("Command rejected ({})", status);
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    Ok(())
}

fn sign_command(key: &str, file: &Path, block_number: Option<u64>) -> Result<()> {
    let keypair = KeyPair::from_secret(SecretKey::from_hex(key)?);
    let content = std::fs::read_to_string(file)?;
    let mut cmd: Command = serde_json::from_str(&content)?;

    if cmd.command_type != CommandType::Nonced {
        bail!("only nonced commands are signed");
    }
    if cmd.timestamp.is_none() {
        cmd.timestamp = Some(now_millis());
    }
    if cmd.block_number.is_none() {
        match block_number {
            Some(number) => cmd.block_number = Some(number),
            None => bail!("command has no block_number; pass --block-number"),
        }
    }
    cmd.sign(&keypair)?;

    std::fs::write(file, serde_json::to_string_pretty(&cmd)?)?;
    println!("Signed command {} as {}", cmd.hash()?, keypair.public.to_hex());

    Ok(())
}
