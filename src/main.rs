//! Scan worker binary.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rezero::model::{ScanTarget, WebCredentials};
use rezero::relay::HttpRelay;
use rezero::{Config, ScanRunner, ScanSession};

#[derive(Parser)]
#[command(name = "rezero", about = "Agent-driven security scanner", version)]
struct Cli {
    /// Project the scan belongs to.
    #[arg(long)]
    project_id: String,

    /// Codebase snapshot directory to audit.
    #[arg(long, conflicts_with = "url")]
    repo: Option<String>,

    /// Web application URL to audit.
    #[arg(long)]
    url: Option<String>,

    /// Username for authenticated web targets.
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Password for authenticated web targets.
    #[arg(long, env = "REZERO_TARGET_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Model identifier; overrides REZERO_MODEL.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rezero=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let target = match (cli.repo, cli.url) {
        (Some(snapshot_dir), None) => ScanTarget::Codebase { snapshot_dir },
        (None, Some(url)) => ScanTarget::WebApp {
            url,
            credentials: match (cli.username, cli.password) {
                (Some(username), Some(password)) => Some(WebCredentials { username, password }),
                _ => None,
            },
        },
        _ => bail!("exactly one of --repo or --url is required"),
    };

    let model = cli.model.unwrap_or_else(|| config.llm.model.clone());
    let mut session = ScanSession::new(cli.project_id, target, &model);
    session.harness = config.harness_for_model(&model);

    let store = Arc::new(HttpRelay::new(config.relay.clone()));
    let runner = ScanRunner::new(store, config).context("failed to initialize scan runner")?;

    tracing::info!(scan_id = %session.id, model, harness = ?session.harness, "starting scan");
    let report = runner
        .run(&mut session)
        .await
        .context("scan ended in failure")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
