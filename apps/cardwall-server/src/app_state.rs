use std::sync::Arc;
use std::time::Instant;

use cardwall_events::Bus;
use cardwall_kernel::Kernel;
use tokio::sync::watch;

use crate::coordinate::Coordinator;

#[derive(Clone)]
pub struct AppState {
    bus: Bus,
    kernel: Kernel,
    coordinator: Arc<Coordinator>,
    shutdown: Arc<watch::Sender<bool>>,
    started: Instant,
    port: u16,
}

impl AppState {
    pub fn new(bus: Bus, kernel: Kernel, shutdown: watch::Sender<bool>, port: u16) -> Self {
        Self {
            bus,
            kernel,
            coordinator: Arc::new(Coordinator::default()),
            shutdown: Arc::new(shutdown),
            started: Instant::now(),
            port,
        }
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
