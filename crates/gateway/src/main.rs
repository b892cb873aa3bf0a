use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sy_gateway::cli::{Cli, Command, ConfigCommand};
use sy_gateway::state::GatewayState;
use sy_store::{BlobStore, FileKv, FsBlobStore, KvBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let state = build_state(&cli)?;
            run_server(cli, state).await
        }
        Some(Command::Config { ref command }) => {
            let state = build_state(&cli)?;
            match command {
                ConfigCommand::Show => {
                    let masked = state.config.get_masked(None);
                    println!("{}", serde_json::to_string_pretty(&masked)?);
                }
                ConfigCommand::Validate => {
                    // `typed()` falls back to defaults on a broken tree, so
                    // compare round-trips to surface drift.
                    let merged = state.config.merged();
                    serde_json::from_value::<sy_domain::config::GatewayConfig>(merged)
                        .context("config tree does not deserialize")?;
                    println!("config ok");
                }
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_state(cli: &Cli) -> anyhow::Result<GatewayState> {
    let kv: Arc<dyn KvBackend> = Arc::new(
        FileKv::new(&cli.state_dir.join("kv")).context("opening KV store")?,
    );
    let blob: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::new(&cli.state_dir.join("blob")).context("opening blob store")?,
    );
    let state = GatewayState::new(kv, blob).context("building gateway state")?;

    if cli.config.exists() {
        let raw = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading {}", cli.config.display()))?;
        state
            .config
            .seed_from_toml(&raw)
            .context("seeding config overrides")?;
    }
    Ok(state)
}

async fn run_server(cli: Cli, state: GatewayState) -> anyhow::Result<()> {
    state.spawn_background();
    let _queue = sy_gateway::queue::spawn_consumer(state.clone());

    let app = sy_gateway::http::router(state);
    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(listen = %cli.listen, "switchyard gateway listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
