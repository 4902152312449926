use anyhow::{Context, Result};
use meshprov_core::MeshSession;
use meshprov_core::server::RequestServer;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::utils::{print_info, print_warning};

pub async fn handle_serve(session: Arc<MeshSession>, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    print_info(&format!("Serving requests on {listen}, Ctrl-C to stop"));

    let server = Arc::new(RequestServer::new(session));
    tokio::select! {
        served = server.serve(listener) => served.context("Request server stopped"),
        _ = tokio::signal::ctrl_c() => {
            print_warning("Interrupted, shutting down");
            Ok(())
        }
    }
}
