//! Command-line client for the why-decision answering gateway: submit
//! `/v2/ask`/`/v2/query`/`/v2/schema` requests to a running `gatewayd`,
//! and independently verify a persisted `response.json` artefact's
//! Ed25519 signature against a known public key.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Why-decision gateway client.
#[derive(Parser, Debug)]
#[command(author, version, about = "Why-decision gateway client", long_about = None)]
struct Cli {
    /// Increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Base URL of a running `gatewayd`.
    #[arg(long, env = "GATEWAY_URL", default_value = "http://localhost:8080")]
    gateway_url: String,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a why-decision question via `POST /v2/ask`.
    Ask {
        /// Already-canonical anchor id, takes precedence over `decision_ref`.
        #[arg(long)]
        anchor_id: Option<String>,
        /// An alias for an anchor id.
        #[arg(long)]
        decision_ref: Option<String>,
        /// Free-text question, used when neither id flag is given.
        question: Option<String>,
    },
    /// Resolve free text via `POST /v2/query`.
    Query {
        /// The text to resolve.
        text: String,
    },
    /// Fetch a schema catalog via `GET /v2/schema/{fields,rels}`.
    Schema {
        /// Which catalog to fetch.
        #[arg(value_enum)]
        kind: SchemaArg,
    },
    /// Verify a persisted `response.json` artefact's signature.
    Verify {
        /// Path to the `response.json` artefact.
        response_path: PathBuf,
        /// Base64-encoded 32-byte Ed25519 public key.
        #[arg(long, env = "GATEWAY_VERIFYING_KEY_B64")]
        public_key_b64: String,
    },
}

#[derive(ValueEnum, Clone, Debug)]
enum SchemaArg {
    /// `GET /v2/schema/fields`.
    Fields,
    /// `GET /v2/schema/rels`.
    Rels,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = reqwest::Client::new();

    match cli.command {
        Commands::Ask {
            anchor_id,
            decision_ref,
            question,
        } => {
            let body = serde_json::json!({
                "anchor_id": anchor_id,
                "decision_ref": decision_ref,
                "question": question.unwrap_or_default(),
            });
            let resp = client
                .post(format!("{}/v2/ask", cli.gateway_url))
                .json(&body)
                .send()
                .await?;
            print_response(resp).await
        }
        Commands::Query { text } => {
            let body = serde_json::json!({"text": text});
            let resp = client
                .post(format!("{}/v2/query", cli.gateway_url))
                .json(&body)
                .send()
                .await?;
            print_response(resp).await
        }
        Commands::Schema { kind } => {
            let segment = match kind {
                SchemaArg::Fields => "fields",
                SchemaArg::Rels => "rels",
            };
            let resp = client
                .get(format!("{}/v2/schema/{segment}", cli.gateway_url))
                .send()
                .await?;
            print_response(resp).await
        }
        Commands::Verify {
            response_path,
            public_key_b64,
        } => verify_artefact(&response_path, &public_key_b64),
    }
}

async fn print_response(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("gateway returned {status}");
    }
    Ok(())
}

fn verify_artefact(path: &PathBuf, public_key_b64: &str) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let signature = gateway_cli::verify_response_str(&raw, public_key_b64)?;
    println!(
        "signature OK: alg={} key_id={} signed_at={}",
        signature.alg, signature.key_id, signature.signed_at
    );
    Ok(())
}
