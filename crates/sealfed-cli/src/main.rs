mod client;
mod import;
mod replication;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sealfed_config::{ConfigResolver, LogFormat, SealfedConfig};
use sealfed_core::idcard::format_instant;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

use crate::import::{ImportRequest, import_keystore};
use crate::replication::ReplicationClient;

#[derive(Parser)]
#[command(
    name = "sealfed",
    version,
    about = "Federated ID-card client for registry replication"
)]
struct Cli {
    /// Config file (TOML or JSON). Defaults to $SEALFED_CONFIG, then ./sealfed.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch an ID card from the token service and print a summary.
    Token,
    /// Fetch replication pages, following the continuation offset.
    Replicate(ReplicateArgs),
    #[command(subcommand)]
    Keystore(KeystoreCmd),
}

#[derive(Args)]
struct ReplicateArgs {
    #[arg(long)]
    register: String,
    #[arg(long)]
    datatype: String,
    #[arg(long)]
    offset: Option<String>,
    #[arg(long, default_value_t = 1)]
    max_records: u32,
    #[arg(long, default_value_t = 1)]
    pages: u32,
}

#[derive(Subcommand)]
enum KeystoreCmd {
    /// Write a key store from a PEM certificate and PKCS#8 key.
    Import(ImportArgs),
}

#[derive(Args)]
struct ImportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    alias: String,
    #[arg(long)]
    cert: PathBuf,
    #[arg(long)]
    key: PathBuf,
    /// Environment variable holding the key store password.
    #[arg(long, default_value = "SEALFED_KEYSTORE_PASSWORD")]
    password_env: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Token => {
            let config = load_config(cli.config)?;
            handle_token(&config)
        }
        Command::Replicate(args) => {
            let config = load_config(cli.config)?;
            handle_replicate(&config, &args)
        }
        Command::Keystore(KeystoreCmd::Import(args)) => {
            telemetry::init(LogFormat::Text, None)?;
            handle_import(&args)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SealfedConfig> {
    let mut resolver = ConfigResolver::new();
    if let Some(path) = path {
        resolver = resolver.with_config_path(path);
    }
    let config = resolver.load()?;
    telemetry::init(config.log_format, config.log_filter.as_deref())?;
    Ok(config)
}

fn handle_token(config: &SealfedConfig) -> Result<()> {
    let transport = client::signed_transport(config)?;
    let card = transport
        .tokens()
        .assertion()
        .context("failed to obtain an ID card")?;
    let summary = json!({
        "card_id": card.card_id(),
        "issuer": card.issuer(),
        "system": card.system_name(),
        "org_cvr": card.org_cvr(),
        "org_name": card.org_name(),
        "authentication_level": card.authentication_level().level(),
        "not_before": format_instant(card.not_before()),
        "not_on_or_after": format_instant(card.not_on_or_after()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn handle_replicate(config: &SealfedConfig, args: &ReplicateArgs) -> Result<()> {
    let transport = client::signed_transport(config)?;
    let client = ReplicationClient::new(transport, config.service_url.as_str())
        .with_max_records(args.max_records);

    let mut offset = args.offset.clone();
    for page in 1..=args.pages {
        let fetched = client.fetch_page(&args.register, &args.datatype, offset.as_deref())?;
        println!("{}", fetched.feed.to_xml());
        info!(page, next_offset = ?fetched.next_offset, "replication page fetched");
        match fetched.next_offset {
            Some(next) => offset = Some(next),
            None => break,
        }
    }
    Ok(())
}

fn handle_import(args: &ImportArgs) -> Result<()> {
    let password = std::env::var(&args.password_env)
        .with_context(|| format!("environment variable {} is not set", args.password_env))?;
    import_keystore(&ImportRequest {
        out: &args.out,
        alias: &args.alias,
        cert: &args.cert,
        key: &args.key,
        password: &password,
    })?;
    println!("wrote {} (alias {})", args.out.display(), args.alias);
    Ok(())
}
