use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use edge_auth::{
    Decision, EdgeConfig, EdgeRequest, HttpJwksFetcher, LifecycleController, Outcome,
    SessionRecord, UnverifiedJwt, load_config_from_file, session,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "edge-auth", about = "Edge session engine: inspect cookies and tokens")]
struct Cli {
    /// Configuration file (`.json`, otherwise TOML)
    #[arg(long, global = true, default_value = "edge-auth.toml")]
    config: PathBuf,

    #[arg(long, global = true)]
    json: bool,

    /// Log engine decisions at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Browser sessions carried in cookies
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Id tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Load and validate the configuration, print derived endpoints
    Check,
}

#[derive(Debug, Subcommand)]
enum SessionCommands {
    /// Decode the session carried by one or more Cookie headers
    Decode {
        #[arg(long = "cookie", required = true)]
        cookies: Vec<String>,
    },
    /// Decide a request the way the edge would
    Check {
        #[arg(long = "cookie")]
        cookies: Vec<String>,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "/")]
        uri: String,
    },
    /// Print the Set-Cookie lines that sign the session out
    SignOut {
        #[arg(long = "cookie")]
        cookies: Vec<String>,
        #[arg(long)]
        host: String,
    },
}

#[derive(Debug, Subcommand)]
enum TokenCommands {
    /// Print header and claims without verifying the signature
    Inspect { token: String },
    /// Verify against the configured issuer, audience and JWKS
    Verify { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Check => {
                let config = load_config(&cli.config)?;
                let text = format!(
                    "Configuration OK\n  client id: {}\n  issuer:    {}\n  jwks uri:  {}\n  sign-in:   https://{}/oauth2/authorize",
                    config.client_id, config.issuer, config.jwks_uri, config.auth_domain
                );
                pout(cli.json, serde_json::to_value(&config)?, &text)?;
            }
        },
        Commands::Session { command } => match command {
            SessionCommands::Decode { cookies } => {
                let config = load_config(&cli.config)?;
                let request = edge_request(cookies, None, "/");
                let record = session::decode(&request.headers, &config.client_id);
                pout(cli.json, session_summary(&record), &format!("{record:#?}"))?;
            }
            SessionCommands::Check { cookies, host, uri } => {
                let controller = controller(load_config(&cli.config)?)?;
                let outcome = controller
                    .check(&edge_request(cookies, Some(host), &uri))
                    .await?;
                let headers = controller.response_headers(&outcome);
                pout(
                    cli.json,
                    outcome_value(&outcome, &headers)?,
                    &outcome_text(&outcome, &headers),
                )?;
            }
            SessionCommands::SignOut { cookies, host } => {
                let controller = controller(load_config(&cli.config)?)?;
                let outcome = controller.sign_out(&edge_request(cookies, Some(host), "/"))?;
                let headers = controller.response_headers(&outcome);
                pout(
                    cli.json,
                    outcome_value(&outcome, &headers)?,
                    &outcome_text(&outcome, &headers),
                )?;
            }
        },
        Commands::Token { command } => match command {
            TokenCommands::Inspect { token } => {
                let jwt = UnverifiedJwt::parse(&token)?;
                let value = json!({
                    "header": serde_json::to_value(&jwt.header)?,
                    "claims": serde_json::to_value(&jwt.claims)?,
                });
                pout(cli.json, value.clone(), &serde_json::to_string_pretty(&value)?)?;
            }
            TokenCommands::Verify { token } => {
                let controller = controller(load_config(&cli.config)?)?;
                match controller.verifier().verify(&token).await {
                    Ok(claims) => {
                        let who = claims.username().unwrap_or(&claims.subject).to_string();
                        pout(
                            cli.json,
                            json!({"valid": true, "claims": serde_json::to_value(&claims)?}),
                            &format!("Token valid for {who}"),
                        )?;
                    }
                    Err(e) => {
                        if cli.json {
                            let value = json!({
                                "valid": false,
                                "error": e.kind(),
                                "message": e.to_string(),
                            });
                            pout(true, value, "")?;
                        }
                        anyhow::bail!("Token rejected ({}): {e}", e.kind());
                    }
                }
            }
        },
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "edge_auth=debug,warn" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn load_config(path: &Path) -> anyhow::Result<EdgeConfig> {
    load_config_from_file(path).with_context(|| format!("Cannot load {}", path.display()))
}

fn controller(config: EdgeConfig) -> anyhow::Result<LifecycleController<HttpJwksFetcher>> {
    LifecycleController::from_config(config).context("Cannot build the JWKS client")
}

fn edge_request(cookies: Vec<String>, host: Option<String>, uri: &str) -> EdgeRequest {
    let mut request = EdgeRequest::new(uri);
    if let Some(host) = host {
        request = request.with_header("host", host);
    }
    for cookie in cookies {
        request = request.with_header("cookie", cookie);
    }
    request
}

fn session_summary(record: &SessionRecord) -> Value {
    json!({
        "username": record.username,
        "hasIdToken": record.id_token.is_some(),
        "hasAccessToken": record.access_token.is_some(),
        "hasRefreshToken": record.refresh_token.is_some(),
        "scopes": record.scopes,
        "pendingAuth": record.has_pending_auth(),
    })
}

fn decision_name(decision: &Decision) -> &'static str {
    match decision {
        Decision::Allow => "allow",
        Decision::RedirectToLogin(_) => "redirect_to_login",
        Decision::RedirectToIdentityProvider(_) => "redirect_to_identity_provider",
        Decision::RefreshTokens => "refresh_tokens",
        Decision::ClearSession => "clear_session",
    }
}

fn outcome_value(outcome: &Outcome, headers: &[(String, String)]) -> anyhow::Result<Value> {
    let headers: Vec<Value> = headers
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();
    Ok(json!({
        "state": serde_json::to_value(outcome.state)?,
        "decision": decision_name(&outcome.decision),
        "location": outcome.location,
        "headers": headers,
        "session": session_summary(&outcome.session),
    }))
}

fn outcome_text(outcome: &Outcome, headers: &[(String, String)]) -> String {
    let mut lines = vec![format!(
        "{:?} -> {}",
        outcome.state,
        decision_name(&outcome.decision)
    )];
    if let Some(location) = &outcome.location {
        lines.push(format!("location: {location}"));
    }
    for (name, value) in headers {
        lines.push(format!("{name}: {value}"));
    }
    lines.join("\n")
}

pub fn pout(json_mode: bool, value: Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
