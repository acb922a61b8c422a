use agentflow_core::catalog::{AgentCatalog, CatalogFile};
use agentflow_server::routes;
use agentflow_server::state::{self, AppState};
use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("agentflow_core=info".parse().unwrap())
                .add_directive("agentflow_server=info".parse().unwrap()),
        )
        .init();

    // Parse CLI args
    let mut args = std::env::args().skip(1);
    let mut catalog_path: Option<PathBuf> = None;
    let mut addr_arg: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--addr" | "--bind" => {
                addr_arg = args.next();
            }
            "--catalog" => {
                catalog_path = args.next().map(PathBuf::from);
            }
            "-h" | "--help" => {
                println!(
                    "Usage: agentflow-server [--catalog agents.yaml] [--addr HOST:PORT]\n\
Defaults: catalog=agents.yaml (optional), addr=127.0.0.1:8080\n\
Env: AGENTFLOW_ADDR, AGENTFLOW_AGENT_TOKEN (bearer token for agent calls)"
                );
                return Ok(());
            }
            _ => {
                if catalog_path.is_none() {
                    catalog_path = Some(PathBuf::from(arg));
                }
            }
        }
    }

    let agent_token = std::env::var("AGENTFLOW_AGENT_TOKEN")
        .ok()
        .and_then(|v| if v.trim().is_empty() { None } else { Some(v) });
    if agent_token.is_none() {
        tracing::warn!("AGENTFLOW_AGENT_TOKEN is not set; agent calls go out unauthenticated.");
    }

    let (state, deliveries) = AppState::new(agent_token);

    // Seed the catalog. An explicitly named file must exist; the default
    // one is optional because agents can be registered over HTTP.
    let explicit = catalog_path.is_some();
    let catalog_path = catalog_path.unwrap_or_else(|| PathBuf::from("agents.yaml"));
    if catalog_path.exists() {
        let file = CatalogFile::load(&catalog_path)
            .await
            .with_context(|| format!("failed to load catalog {}", catalog_path.display()))?;
        let count = file.agents.len();
        for agent in file.agents {
            tracing::info!(
                "Registered agent '{}' for kind '{}' at {}",
                agent.name,
                agent.task_kind,
                agent.execution_url()
            );
            state
                .catalog
                .upsert(agent)
                .await
                .context("failed to seed catalog")?;
        }
        tracing::info!("Loaded {} agent(s) from {}", count, catalog_path.display());
    } else if explicit {
        anyhow::bail!("catalog file not found: {}", catalog_path.display());
    } else {
        tracing::info!(
            "No {} found; starting with an empty catalog",
            catalog_path.display()
        );
    }

    // Drain the local queue in the background
    state::spawn_delivery_loop(state.engine.clone(), deliveries);

    // Get address from args/env or use default (127.0.0.1:8080)
    let addr: SocketAddr = addr_arg
        .or_else(|| std::env::var("AGENTFLOW_ADDR").ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| ([127, 0, 0, 1], 8080).into());

    let api_routes = routes::routes(state);

    tracing::info!("Starting broker at http://{}", addr);

    let (bound, server) =
        warp::serve(api_routes).bind_with_graceful_shutdown(addr, shutdown_signal());
    tracing::info!("Listening on {}", bound);
    server.await;

    tracing::info!("Shut down cleanly");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
