use anyhow::Context;
use clap::Parser;
use courier_rs::config::Config;
use courier_rs::delivery::{Forwarder, MaildirProcessor, NoRelay, RelayForwarder};
use courier_rs::imap::ImapServer;
use courier_rs::security::{CredentialVerifier, SqliteAuthenticator, TlsConfig};
use courier_rs::smtp::{MailIngressServer, SmtpClient};
use courier_rs::storage::MaildirStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "IMAP and SMTP mail server", long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults are used when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        "pretty" => tracing_subscriber::fmt().with_env_filter(filter).pretty().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        Config::default()
    };
    init_logging(&config);

    info!("Starting courier");
    info!("  Domain: {}", config.server.domain);
    info!("  IMAP listening on: {}", config.imap.listen_addr);
    info!("  Maildir path: {}", config.storage.maildir_path);

    let tls = TlsConfig::load(&config.tls, &config.server.hostname)
        .context("Failed to load TLS certificate")?;
    let authenticator: Arc<dyn CredentialVerifier> = Arc::new(
        SqliteAuthenticator::new(&config.storage.database_url)
            .await
            .context("Failed to open user database")?,
    );
    let store = Arc::new(MaildirStore::new(&config.storage.maildir_path));

    let forwarder: Arc<dyn Forwarder> = match &config.smtp.relay_host {
        Some(relay) => Arc::new(RelayForwarder::new(
            SmtpClient::new(relay.clone()).with_helo_name(config.server.hostname.clone()),
        )),
        None => Arc::new(NoRelay),
    };

    let smtp = MailIngressServer::with_security(
        &config.server,
        config.smtp.clone(),
        forwarder,
        Arc::new(MaildirProcessor::new(store.clone())),
        tls.clone(),
        Some(authenticator.clone()),
    );

    let mut imap = ImapServer::new(
        config.imap.clone(),
        store.clone(),
        store,
        authenticator,
    );
    if let Some(tls) = tls {
        imap = imap.with_tls(tls);
    }

    tokio::select! {
        result = smtp.run() => {
            if let Err(e) = &result {
                error!("SMTP server error: {}", e);
            }
            result?;
        }
        result = imap.run() => {
            if let Err(e) = &result {
                error!("IMAP server error: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
