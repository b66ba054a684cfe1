mod cache;
mod cmd;
mod consts;
mod credential_providers;
mod remote;
mod server;
mod signal;
mod token;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cmd::{Cli, Commands};
use credential_providers::TokenProvider;
use token::Token;

#[tokio::main]
async fn main() {
    // Stdout carries the credential document; everything else goes to
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let shutdown = signal::shutdown_token()?;

    match cli.command {
        Commands::Serve { socket } => server::serve(&socket, shutdown).await,
        Commands::Aws(args) => {
            let socket = args.socket.clone();
            emit(&socket, &mut credential_providers::aws::AwsOptions::from(args)).await
        }
        Commands::Azure(args) => {
            let socket = args.socket.clone();
            emit(&socket, &mut credential_providers::azure::AzureOptions::from(args)).await
        }
        Commands::Gcp(args) => {
            let socket = args.socket.clone();
            emit(&socket, &mut credential_providers::gcp::GcpOptions::from(args)).await
        }
    }
}

/// Gets a token and prints it as an ExecCredential document.
async fn emit<P: TokenProvider>(socket: &Path, options: &mut P) -> Result<()> {
    let token: Token = remote::get_client_token(socket, options).await?;

    println!("{}", token.to_exec_credential_json()?);

    Ok(())
}
