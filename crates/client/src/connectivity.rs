use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the device currently has network connectivity.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag flipped by the host application.
#[derive(Debug)]
pub struct NetworkStatus {
    online: AtomicBool,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!(online, "network status changed");
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
