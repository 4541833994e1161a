//! Transaction Token Service
//!
//! Issues transaction tokens over an RFC 8693 token endpoint, keeps its
//! generation rules in sync with a control plane, and offers a `verify`
//! command for checking a token against a resource's binding rules.

use anyhow::{anyhow, Context, Result};
use axum::http::HeaderName;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use txn_token_service::error::SyncError;
use txn_token_service::exchange::TokenService;
use txn_token_service::jwks::JwksCache;
use txn_token_service::keys::{KeyConfig, KeyManager};
use txn_token_service::rules::{GenerationRuleSet, HttpMethod, RuleStore};
use txn_token_service::server::{build_router, AppState};
use txn_token_service::sync::{SyncClient, SyncConfig};
use txn_token_service::verify::{InboundRequest, RequestBinder, TxnTokenVerifier, VerificationRules};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "txn-token-service")]
#[command(about = "Transaction token issuer and verifier")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true, env = "TRAT_VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the token service
    Serve(ServeArgs),
    /// Verify a transaction token and optionally bind it to a request
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "TRAT_LISTEN")]
    listen: SocketAddr,

    /// Control plane WebSocket URL (ws:// or wss://)
    #[arg(long, env = "TCONFIG_URL")]
    control_plane_url: Option<String>,

    /// Namespace whose rules this instance serves
    #[arg(long, default_value = "default", env = "TCONFIG_NAMESPACE")]
    namespace: String,

    /// Bearer token for the control plane
    #[arg(long, env = "TCONFIG_TOKEN")]
    control_plane_token: Option<String>,

    /// Heartbeat interval in seconds, until the control plane sets one
    #[arg(long, default_value_t = 30, env = "TCONFIG_HEARTBEAT_SECS")]
    heartbeat_secs: u64,

    /// Consecutive reconnect failures before giving up
    #[arg(long, default_value_t = 10, env = "TCONFIG_MAX_ATTEMPTS")]
    max_reconnect_attempts: u32,

    /// RSA signing key (PEM). Generated when unset.
    #[arg(long, env = "TRAT_SIGNING_KEY")]
    signing_key: Option<PathBuf>,

    /// Published key id. Defaults to the key thumbprint.
    #[arg(long, env = "TRAT_KEY_ID")]
    key_id: Option<String>,

    /// Static rule set (YAML or JSON), used instead of a control plane
    #[arg(long, env = "TRAT_RULES_FILE")]
    rules_file: Option<PathBuf>,

    /// Header carrying the authenticated caller identity
    #[arg(long, default_value = "x-caller-id", env = "TRAT_CALLER_HEADER")]
    caller_header: String,

    /// Deadline for a single token request in seconds
    #[arg(long, default_value_t = 10, env = "TRAT_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// The transaction token
    #[arg(long, env = "TXN_TOKEN")]
    token: String,

    /// JWKS URL of the issuing service
    #[arg(long, env = "TRAT_JWKS_URL")]
    jwks_url: String,

    #[arg(long, env = "TRAT_ISSUER")]
    issuer: String,

    #[arg(long, env = "TRAT_AUDIENCE")]
    audience: String,

    /// Binding rules (YAML or JSON). Without them only the token is checked.
    #[arg(long, env = "VERIFY_RULES_FILE")]
    rules_file: Option<PathBuf>,

    /// Request method to bind against
    #[arg(long, default_value = "GET")]
    method: String,

    /// Request path to bind against
    #[arg(long)]
    path: Option<String>,

    /// Request body (JSON)
    #[arg(long)]
    body: Option<String>,

    /// Request headers as name:value, repeatable
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Header carrying the caller identity set by the upstream authenticator
    #[arg(long, default_value = "x-user-name", env = "VERIFY_IDENTITY_HEADER")]
    identity_header: String,
}

impl ServeArgs {
    fn sync_config(&self) -> Result<Option<SyncConfig>> {
        let Some(url) = &self.control_plane_url else {
            return Ok(None);
        };
        let mut config = SyncConfig::new(url, &self.namespace);
        config.bearer_token = self.control_plane_token.clone();
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_secs);
        config.max_attempts = self.max_reconnect_attempts;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid control plane configuration: {}", e))?;
        Ok(Some(config))
    }

    fn key_config(&self) -> Result<KeyConfig> {
        let config = KeyConfig {
            private_key_path: self.signing_key.clone(),
            key_id: self.key_id.clone(),
            ..KeyConfig::default()
        };
        config
            .validate()
            .map_err(|e| anyhow!("Invalid key configuration: {}", e))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={},tower_http=info", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Verify(args) => verify(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    info!("Starting transaction token service");

    let sync_config = args.sync_config()?;
    if sync_config.is_none() && args.rules_file.is_none() {
        return Err(anyhow!(
            "Either --control-plane-url or --rules-file must be supplied"
        ));
    }

    let keys = Arc::new(KeyManager::load(&args.key_config()?)?);
    info!(kid = %keys.kid()?, "Signing key loaded");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;
    let store = Arc::new(RuleStore::new(http_client)?);

    if let Some(path) = &args.rules_file {
        let rule_set = GenerationRuleSet::from_file(path)?;
        let hash = store.replace_all(rule_set).await?;
        info!(path = %path.display(), rules_hash = %hash, "Static rule set installed");
    }

    let shutdown = CancellationToken::new();

    let sync_handle = sync_config.map(|config| {
        info!(url = %config.url, namespace = %config.namespace, "Starting control plane sync");
        let client = SyncClient::new(config, store.clone(), shutdown.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = client.run().await;
            if let Err(e) = &result {
                error!(error = %e, "Control plane sync stopped");
            }
            shutdown.cancel();
            result
        })
    });

    let mut state = AppState::new(Arc::new(TokenService::new(store, keys)));
    state.caller_header = HeaderName::try_from(args.caller_header.as_str())
        .with_context(|| format!("Invalid caller header '{}'", args.caller_header))?;
    state.request_timeout = Duration::from_secs(args.request_timeout_secs);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "Listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    let graceful = shutdown.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .context("Server failed")?;

    if let Some(handle) = sync_handle {
        match handle.await {
            Ok(Err(SyncError::Fatal(reason))) => {
                return Err(anyhow!("Control plane sync failed: {}", reason));
            }
            Ok(Err(e)) => return Err(anyhow!("Control plane sync failed: {}", e)),
            Ok(Ok(())) => {}
            Err(e) => warn!(error = %e, "Sync task aborted"),
        }
    }

    info!("Stopped");
    Ok(())
}

async fn verify(args: VerifyArgs) -> Result<()> {
    let keys = JwksCache::new(args.jwks_url.clone(), 300).await?;
    let mut verifier = TxnTokenVerifier::new(&args.issuer, &args.audience, Arc::new(keys));

    let Some(rules_file) = &args.rules_file else {
        let claims = verifier.parse_and_verify(&args.token).await?;
        println!("{}", serde_json::to_string_pretty(&claims)?);
        return Ok(());
    };

    let raw = std::fs::read_to_string(rules_file)
        .with_context(|| format!("Failed to read {}", rules_file.display()))?;
    let rules = VerificationRules::from_yaml(&raw)
        .with_context(|| format!("Failed to parse {}", rules_file.display()))?;
    verifier = verifier.with_binder(RequestBinder::new(rules.rules, &args.identity_header)?);

    let method: HttpMethod = args.method.parse().map_err(|e: String| anyhow!(e))?;
    let path = args
        .path
        .as_deref()
        .ok_or_else(|| anyhow!("--path is required with --rules-file"))?;

    let mut request = InboundRequest::new(method, path).with_header("txn-token", &args.token);
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("Header '{}' must be name:value", header))?;
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(body) = &args.body {
        let body: Value = serde_json::from_str(body).context("Request body is not JSON")?;
        request = request.with_body(body);
    }

    let claims = verifier.verify_request(&request).await?;
    info!(txn = %claims.txn, purpose = %claims.purp, "Token bound to request");
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_args() {
        let cli = Cli::parse_from([
            "txn-token-service",
            "serve",
            "--control-plane-url",
            "ws://tconfig:9000/ws",
            "--namespace",
            "stocks",
            "--heartbeat-secs",
            "5",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.sync_config().unwrap().unwrap();
        assert_eq!(config.namespace, "stocks");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(args.key_config().is_ok());
    }

    #[test]
    fn test_invalid_control_plane_url() {
        let cli = Cli::parse_from([
            "txn-token-service",
            "serve",
            "--control-plane-url",
            "http://tconfig:9000",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.sync_config().is_err());
    }

    #[test]
    fn test_verify_args() {
        let cli = Cli::parse_from([
            "txn-token-service",
            "verify",
            "--token",
            "a.b.c",
            "--jwks-url",
            "http://txn/.well-known/jwks.json",
            "--issuer",
            "https://txn.example.com",
            "--audience",
            "stocks.example.com",
            "--header",
            "x-user-name: alice@example.com",
            "-v",
        ]);
        assert!(cli.verbose);
        let Command::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(args.headers.len(), 1);
        assert_eq!(args.identity_header, "x-user-name");
    }
}
