mod node;
mod serve;
mod shell;

use anyhow::{Context, Result};
use meshprov_core::{AddressAllocator, MeshSession, NodeDirectory, SessionConfig};
use std::sync::Arc;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::output::OutputFormat;

pub async fn handle_command(cli: Cli) -> Result<()> {
    // Determine output format
    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    // The directory listing works offline
    if let Commands::Nodes = cli.command {
        let directory = NodeDirectory::load(&cli.db)
            .with_context(|| format!("Failed to load {}", cli.db.display()))?;
        crate::output::print_nodes(&directory.nodes(), output_format);
        return Ok(());
    }

    let session = connect(&cli).await?;

    let result = match cli.command {
        Commands::Serve { listen } => serve::handle_serve(session.clone(), &listen).await,
        Commands::Shell => shell::handle_shell(session.clone(), output_format).await,
        Commands::Scan { duration } => {
            node::handle_scan(&session, duration, output_format).await
        }
        Commands::Provision { uuid, scan } => {
            node::handle_provision(&session, &uuid, scan, output_format).await
        }
        Commands::Unprovision { address } => node::handle_unprovision(&session, address).await,
        Commands::Publish(target) => node::handle_publish(&session, target).await,
        Commands::Subscribe(target) => node::handle_subscribe(&session, target).await,
        Commands::Nodes => Ok(()),
    };

    session.close().await;
    result
}

async fn connect(cli: &Cli) -> Result<Arc<MeshSession>> {
    let directory = NodeDirectory::load(&cli.db)
        .with_context(|| format!("Failed to load {}", cli.db.display()))?;
    let config = SessionConfig::default().with_device_timeout(cli.timeout);

    let session = MeshSession::connect_bridge(
        &cli.bridge,
        Arc::new(directory),
        &AddressAllocator::default(),
        config,
    )
    .await
    .with_context(|| format!("Failed to connect to device bridge at {}", cli.bridge))?;

    if !cli.skip_setup {
        debug!("Running quick setup");
        session.quick_setup().context("Quick setup failed")?;
    }
    Ok(Arc::new(session))
}
