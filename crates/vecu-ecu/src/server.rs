//! DoIP TCP acceptor.
//!
//! Binds the diagnostic port and spawns one [`DiagnosticSession`] task
//! per accepted connection. Accept failures are logged and accepting
//! continues; only aborting the task (on shutdown) stops the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{error, info};

use crate::ecu::VirtualEcu;
use crate::session::DiagnosticSession;

pub struct DoipServer {
    listener: TcpListener,
    ecu: Arc<VirtualEcu>,
}

impl DoipServer {
    pub async fn bind(addr: impl ToSocketAddrs, ecu: Arc<VirtualEcu>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "DoIP server listening");
        Ok(Self { listener, ecu })
    }

    /// Actual bound address; useful when binding port 0 in tests.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Run this under `tokio::spawn` and
    /// abort the task to shut down; in-flight sessions finish their
    /// current frame best-effort.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "tester connected");
                    let session = DiagnosticSession::new(stream, peer, self.ecu.clone());
                    tokio::spawn(session.run());
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}
