//! Loopback TCP server: one acceptor-role [`EpcManager`] per client.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::manager::EpcManager;
use crate::runtime;

struct ServerInner {
    name: String,
    port: u16,
    clients: RefCell<Vec<(SocketAddr, EpcManager)>>,
    listener: RefCell<Option<JoinHandle<()>>>,
}

/// A listening endpoint. Cloning shares the listener.
#[derive(Clone)]
pub struct EpcServer {
    inner: Rc<ServerInner>,
}

impl EpcServer {
    /// Bind `127.0.0.1:port` and start accepting. Port 0 requests an
    /// OS-assigned port, readable via [`EpcServer::port`].
    ///
    /// `connect_fn` runs for every accepted client *before* any of that
    /// client's calls can be dispatched; register methods there. Must be
    /// called inside a `LocalSet` (see [`crate::runtime`]).
    pub async fn start<F>(port: u16, connect_fn: F) -> io::Result<EpcServer>
    where
        F: Fn(&EpcManager) + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let inner = Rc::new(ServerInner {
            name: format!("epc:server:{port}"),
            port,
            clients: RefCell::new(Vec::new()),
            listener: RefCell::new(None),
        });

        let task = runtime::spawn(accept_loop(
            listener,
            Rc::downgrade(&inner),
            Rc::new(connect_fn),
        ));
        inner.listener.borrow_mut().replace(task);
        tracing::debug!(port, "epc server listening");
        Ok(EpcServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Managers for the clients currently connected.
    pub fn clients(&self) -> Vec<EpcManager> {
        self.inner
            .clients
            .borrow()
            .iter()
            .map(|(_, manager)| manager.clone())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    /// Stop accepting and shut down every connected client. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.inner.listener.borrow_mut().take() {
            task.abort();
        }
        let clients: Vec<_> = self.inner.clients.borrow_mut().drain(..).collect();
        for (_, manager) in clients {
            manager.stop();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Weak<ServerInner>,
    connect_fn: Rc<dyn Fn(&EpcManager)>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(inner) = server.upgrade() else {
                    break;
                };
                let manager = EpcManager::accept(stream);
                // Methods must exist before the peer's first call dispatches.
                connect_fn(&manager);
                inner.clients.borrow_mut().push((addr, manager.clone()));
                tracing::debug!(%addr, name = %manager.name(), "accepted epc client");

                let server = server.clone();
                runtime::spawn(async move {
                    manager.closed().await;
                    if let Some(inner) = server.upgrade() {
                        inner.clients.borrow_mut().retain(|(a, _)| *a != addr);
                    }
                });
            }
            // A failed accept aborts only that client; keep listening.
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}
