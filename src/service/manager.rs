//! Service manager
//!
//! Process-wide map of open service ports plus the shutdown sequence:
//! `stop` tells every port to stop accepting, then a short death timer
//! lets in-flight work settle before `run` returns to its caller.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::port::ServicePort;
use crate::context::NetContext;
use crate::protocol::{ProtocolKind, ServiceDef};

/// Delay between `stop` and the release of `run`
pub const DEATH_TIMER_DELAY: Duration = Duration::from_secs(3);

/// Registry of open service ports
pub struct ServiceManager {
    ctx: Arc<NetContext>,
    ports: Mutex<HashMap<u16, Arc<ServicePort>>>,
    running: AtomicBool,
    died: AtomicBool,
    death_tx: broadcast::Sender<()>,
}

impl ServiceManager {
    /// Create a manager over the shared context
    #[must_use]
    pub fn new(ctx: Arc<NetContext>) -> Arc<Self> {
        let (death_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            ctx,
            ports: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            died: AtomicBool::new(false),
            death_tx,
        })
    }

    /// The shared context this manager was built over
    #[must_use]
    pub fn context(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    /// Register protocol `P` as a service on `port`
    ///
    /// The port is created and opened on first use. Returns `false` when
    /// the port number is zero or the port already hosts a single-socket
    /// service.
    pub fn add<P: ProtocolKind>(&self, port: u16) -> bool {
        if port == 0 {
            warn!(
                service = P::NAME,
                "Service rejected, no port assigned; check the configuration"
            );
            return false;
        }

        let (service_port, newly_created) = {
            let mut ports = self.ports.lock();
            match ports.entry(port) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    let service_port = ServicePort::new(Arc::clone(&self.ctx));
                    entry.insert(Arc::clone(&service_port));
                    (service_port, true)
                }
            }
        };

        // Register before opening so the first accepted socket already
        // sees the service list.
        match service_port.add_service(Arc::new(ServiceDef::<P>::new())) {
            Ok(()) => {
                info!(service = P::NAME, port, "Service registered");
            }
            Err(err) => {
                error!(service = P::NAME, port, error = %err, "Service registration failed");
                return false;
            }
        }

        if newly_created {
            let _ = service_port.open(port);
        }
        true
    }

    /// Look up the port object bound to `port`
    #[must_use]
    pub fn find(&self, port: u16) -> Option<Arc<ServicePort>> {
        self.ports.lock().get(&port).cloned()
    }

    /// Number of open service ports
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.ports.lock().len()
    }

    /// Whether `run` was entered and `stop` has not been called
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Block until the manager dies
    ///
    /// The caller parks here for the lifetime of the server; `stop`
    /// arranges for the call to return.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            error!("Service manager is already running");
            return;
        }

        let mut death_rx = self.death_tx.subscribe();
        if self.died.load(Ordering::SeqCst) {
            return;
        }
        let _ = death_rx.recv().await;
    }

    /// Begin shutdown; idempotent
    ///
    /// Stops every service port, clears the port map and arms the death
    /// timer that releases `run`.
    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping services");

        let drained: Vec<Arc<ServicePort>> =
            self.ports.lock().drain().map(|(_, port)| port).collect();
        for service_port in drained {
            tokio::spawn(async move {
                service_port.on_stop_server();
            });
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEATH_TIMER_DELAY).await;
            manager.die();
        });
    }

    fn die(&self) {
        self.died.store(true, Ordering::SeqCst);
        let _ = self.death_tx.send(());
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("ports", &self.port_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
