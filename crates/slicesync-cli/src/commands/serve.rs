//! Serve command handler

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use slicesync_core::remote::{DocumentServer, DocumentStore};
use slicesync_core::Config;

use crate::output::Output;

/// Run the document server until interrupted
pub async fn serve(config: &Config, addr: Option<String>, output: &Output) -> Result<()> {
    let addr = addr.unwrap_or_else(|| config.server_addr.clone());
    let documents_path = config.documents_path();

    let store = DocumentStore::open(&documents_path)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;

    output.message(&format!(
        "Serving documents from {} on ws://{}",
        documents_path.display(),
        listener.local_addr()?
    ));

    tokio::select! {
        result = DocumentServer::new(store).serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            output.message("Shutting down.");
            Ok(())
        }
    }
}
