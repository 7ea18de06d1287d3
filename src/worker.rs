//! Named OS threads running a typed closure
//!
//! Components own their stop flags and condition variables; a `Worker` is
//! only the join handle plus the thread name for logging.

use crate::{Error, Result};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a new thread called `name`
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| Error::Thread(format!("{}: {}", name, e)))?;
        debug!(thread = %name, "worker started");
        Ok(Self {
            name,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Wait for the thread to finish; the caller must have asked it to stop
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(thread = %self.name, "worker panicked");
            } else {
                debug!(thread = %self.name, "worker joined");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Never block a drop on a thread that was not told to stop
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}
