//! Request Validator for Zentinel
//!
//! Runs a single request description through the validator and prints the
//! resulting response.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zentinel_request_validator::{Endpoint, Request, RequestValidator, Response, ValidatorConfig};

#[derive(Parser, Debug)]
#[command(name = "zentinel-request-validator")]
#[command(author, version, about = "Admission chain for web requests")]
struct Args {
    /// Path to configuration file (JSON or YAML); must set `secrets.cookie_pepper`
    #[arg(short, long)]
    config: PathBuf,

    /// Path to a JSON request description
    #[arg(short, long)]
    request: PathBuf,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout carries only the response
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Endpoint that echoes the attributes gathered by the chain.
struct AttributeEcho;

#[async_trait]
impl Endpoint for AttributeEcho {
    async fn handle(&self, request: Request) -> Response {
        match serde_json::to_string(request.attributes()) {
            Ok(body) => Response::text(200, body).with_header("Content-Type", "application/json"),
            Err(e) => Response::text(500, e.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let config = ValidatorConfig::from_file(&args.config)?;

    let content = std::fs::read_to_string(&args.request)
        .with_context(|| format!("reading request {}", args.request.display()))?;
    let request: Request = serde_json::from_str(&content).context("parsing request")?;

    let validator = RequestValidator::from_config(&config, Arc::new(AttributeEcho))?;

    info!(
        method = %request.method,
        path = %request.path,
        client_ip = %request.client_ip,
        "Validating request"
    );

    let response = validator.handle(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}
