//! Engine-wide table of live frameservers.

use super::config::FrameserverConfig;
use super::controller::{Controller, TickSummary};
use super::process::ProcessLauncher;
use super::sink::FrameserverSink;
use crate::error::{Error, Result};
use crate::observability;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle to a registered frameserver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameserverId(u64);

impl fmt::Display for FrameserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fsrv#{}", self.0)
    }
}

/// Owns every controller of the engine and ticks them together.
///
/// The shutdown flag may be set from a signal handler or another thread;
/// the next [`tick_all`](Self::tick_all) then tears everything down.
pub struct FrameserverRegistry {
    controllers: HashMap<FrameserverId, Controller>,
    next_id: u64,
    shutdown: Arc<AtomicBool>,
}

impl Default for FrameserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameserverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            controllers: HashMap::new(),
            next_id: 1,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn a frameserver and register it.
    pub fn spawn(
        &mut self,
        config: FrameserverConfig,
        launcher: Box<dyn ProcessLauncher>,
        sink: Box<dyn FrameserverSink>,
    ) -> Result<FrameserverId> {
        let controller = Controller::spawn(config, launcher, sink)?;
        Ok(self.insert(controller))
    }

    /// Register an existing controller.
    pub fn insert(&mut self, controller: Controller) -> FrameserverId {
        let id = FrameserverId(self.next_id);
        self.next_id += 1;
        self.controllers.insert(id, controller);
        observability::record_active_frameservers(self.controllers.len());
        id
    }

    /// Look up a controller.
    pub fn get(&self, id: FrameserverId) -> Option<&Controller> {
        self.controllers.get(&id)
    }

    /// Look up a controller mutably.
    pub fn get_mut(&mut self, id: FrameserverId) -> Option<&mut Controller> {
        self.controllers.get_mut(&id)
    }

    /// Free a frameserver and drop it from the table.
    pub fn remove(&mut self, id: FrameserverId) -> Result<()> {
        let mut controller = self.controllers.remove(&id).ok_or(Error::NoSuchObject)?;
        observability::record_active_frameservers(self.controllers.len());
        match controller.free(false) {
            Ok(()) | Err(Error::NoSuchObject) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Number of registered frameservers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<FrameserverId> {
        let mut ids: Vec<_> = self.controllers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flag that requests a full teardown on the next tick.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Tick every controller.
    ///
    /// Errors are per controller; one failing frameserver never stops the
    /// others from being serviced. Returns an empty list after a shutdown.
    pub fn tick_all(&mut self) -> Vec<(FrameserverId, Result<TickSummary>)> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::info!(count = self.controllers.len(), "shutdown requested");
            self.teardown_all();
            return Vec::new();
        }
        let mut results: Vec<_> = self
            .controllers
            .iter_mut()
            .map(|(id, controller)| (*id, controller.tick()))
            .collect();
        results.sort_unstable_by_key(|(id, _)| *id);
        results
    }

    /// Free every frameserver and empty the table.
    pub fn teardown_all(&mut self) {
        for (id, mut controller) in self.controllers.drain() {
            if let Err(e) = controller.free(false) {
                tracing::debug!(%id, error = %e, "frameserver already released");
            }
        }
        observability::record_active_frameservers(0);
    }
}

impl fmt::Debug for FrameserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameserverRegistry")
            .field("frameservers", &self.ids())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for FrameserverRegistry {
    fn drop(&mut self) {
        if !self.controllers.is_empty() {
            self.teardown_all();
        }
    }
}
