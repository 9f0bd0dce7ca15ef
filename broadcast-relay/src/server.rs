use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{info, warn};

use crate::{
    cli::ServerArgs,
    error::RelayError,
    registry::{ConnectionHandle, Registry},
    session::{Session, drain_outbound},
    wire::{Framing, PayloadReader},
};

pub const DEFAULT_MAX_SESSIONS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub max_sessions: usize,
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            framing: Framing::default(),
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            max_sessions: args.max_sessions,
            framing: args.framing,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        let admission = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        tokio::pin!(shutdown);

        loop {
            // Hold a slot before accepting so a full server leaves new peers in the backlog.
            let permit = select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&admission).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, config.framing, permit);
                }
            }
        }

        handle_shutdown(&registry);
        drop(listener);
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

fn handle_shutdown(registry: &Registry) {
    let handles = registry.clear();
    info!(connections = handles.len(), "relay shutting down");
    for handle in handles {
        handle.close();
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    framing: Framing,
    permit: OwnedSemaphorePermit,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, framing, permit),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    framing: Framing,
    permit: OwnedSemaphorePermit,
) {
    let id = registry.next_id();
    let (handle, outbound) = ConnectionHandle::channel();
    registry.add(id, handle.clone());
    info!(%id, %peer, "accepted connection");

    let (reader, writer) = stream.into_split();
    tokio::spawn(drain_outbound(
        writer,
        framing,
        outbound,
        handle.close_token(),
        id,
    ));

    let session = Session::new(
        id,
        peer,
        PayloadReader::new(reader, framing),
        handle,
        Arc::clone(registry),
    );
    tokio::spawn(async move {
        session.run().await;
        drop(permit);
    });
}
