use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};

use crate::lodestone::{net, session};

/// Accept loop for the Minecraft listener. Every connection runs as its own
/// task; a session fault (error or panic) stops at the task boundary and the
/// loop keeps accepting.
pub async fn serve_tcp(
    listen_addr: String,
    opts: Arc<session::SessionOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(&listen_addr);
    let listener = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {bind_addr}"))?;

    tracing::info!(listen_addr = %bind_addr, "proxy: listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("proxy: shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, peer)) => {
                        let opts = opts.clone();
                        tokio::spawn(async move {
                            if tracing::enabled!(tracing::Level::DEBUG) {
                                tracing::debug!(client = %peer, "proxy: accepted");
                            }
                            session::handle(conn, peer, opts).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "proxy: accept failed");
                    }
                }
            }
        }
    }
}
