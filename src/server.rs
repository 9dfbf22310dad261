use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{connection, registry::Registry, router::Router};

/// Accepts connections and hands each one to its own task. The registry and
/// router are built here at startup and shared with every handler; nothing
/// about the membership lives in process-wide state.
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            listener,
            router: Arc::new(Router::new(registry)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` resolves, then tears down:
    /// the listener drops (port released, no new connections), every live
    /// connection is cancelled, and their tasks unwind on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            router,
            shutdown: token,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router, &token);
                }
            }
        }

        drop(listener);
        info!("server shutting down");
        token.cancel();
        router.close_all().await;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    router: &Arc<Router>,
    token: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, router, token),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: &Arc<Router>,
    token: &CancellationToken,
) {
    let router = Arc::clone(router);
    let token = token.child_token();
    tokio::spawn(async move {
        if let Err(err) = connection::handle(stream, addr, router, token).await {
            warn!(peer = %addr, error = ?err, "connection closed with error");
        }
    });
}
