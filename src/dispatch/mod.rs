//! The dispatch loop.
//!
//! Owns the live worker set exclusively. Nothing else reads or writes the
//! map; workers report their own death only by closing their channels.
//!
//! Steady state is one `select!` over three sources, polled in priority
//! order:
//!
//! 1. fatal errors: terminate every worker and return
//! 2. change notifications: add, update or delete a worker
//! 3. inbound events: fan out to every live worker, reaping dead ones first

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::{Event, NotifyOperation, NotifyUpdate, Registration};
use crate::repository::RegistrationRepository;
use crate::worker::{RegistrationWorker, WorkerContext, WorkerHandle};

/// Error type carried on the fatal channel.
pub type FatalError = Box<dyn std::error::Error + Send + Sync>;

/// Reasons the dispatch loop stopped abnormally.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("fatal error, export distribution stopped: {0}")]
    Fatal(#[source] FatalError),
}

/// Routes events and change notifications to registration workers.
pub struct Dispatcher {
    repository: Arc<dyn RegistrationRepository>,
    ctx: WorkerContext,
    startup_retry: Duration,
    workers: HashMap<String, WorkerHandle>,
}

impl Dispatcher {
    pub fn new(
        repository: Arc<dyn RegistrationRepository>,
        ctx: WorkerContext,
        startup_retry: Duration,
    ) -> Self {
        Self {
            repository,
            ctx,
            startup_retry,
            workers: HashMap::new(),
        }
    }

    /// Names of workers currently in the live set.
    pub fn live_workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load every registration and start its worker.
    ///
    /// The registration store may come up after this service, so listing is
    /// retried at a fixed interval until it succeeds.
    pub async fn startup(&mut self) {
        let registrations = loop {
            match self.repository.list().await {
                Ok(registrations) => break registrations,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?self.startup_retry,
                        "Registration store not ready"
                    );
                    tokio::time::sleep(self.startup_retry).await;
                }
            }
        };

        for registration in registrations {
            self.start_worker(registration);
        }
        info!(workers = self.workers.len(), "Export distribution started");
    }

    fn start_worker(&mut self, registration: Registration) -> bool {
        let name = registration.name.clone();
        match RegistrationWorker::build(registration, self.ctx.clone()) {
            Ok(worker) => {
                if let Some(previous) = self.workers.insert(name.clone(), worker.spawn()) {
                    debug!(registration = %name, "Replacing existing worker");
                    previous.terminate();
                }
                true
            }
            Err(e) => {
                error!(registration = %name, error = %e, "Registration rejected");
                false
            }
        }
    }

    /// Apply one change notification. Lookup misses are logged and skipped.
    pub async fn handle_notification(&mut self, update: NotifyUpdate) {
        let name = update.name;
        match update.operation {
            NotifyOperation::Add => match self.repository.by_name(&name).await {
                Ok(registration) => {
                    if self.start_worker(registration) {
                        info!(registration = %name, "Registration added");
                    }
                }
                Err(e) => warn!(registration = %name, error = %e, "Cannot add registration"),
            },

            NotifyOperation::Update => {
                let Some(worker) = self.workers.get(&name) else {
                    warn!(registration = %name, "Update for unknown registration");
                    return;
                };
                let registration = match self.repository.by_name(&name).await {
                    Ok(registration) => registration,
                    Err(e) => {
                        warn!(registration = %name, error = %e, "Cannot update registration");
                        return;
                    }
                };
                if worker.update(registration).await {
                    info!(registration = %name, "Registration update forwarded");
                } else {
                    warn!(registration = %name, "Worker already stopped, removing");
                    self.workers.remove(&name);
                }
            }

            NotifyOperation::Delete => match self.workers.remove(&name) {
                Some(worker) => {
                    worker.terminate();
                    info!(registration = %name, "Registration deleted");
                }
                None => warn!(registration = %name, "Delete for unknown registration"),
            },
        }
    }

    /// Hand an event to every live worker, in turn.
    ///
    /// Each hand-off waits for room in that worker's channel, so a stalled
    /// worker delays the ones after it.
    pub async fn dispatch_event(&mut self, event: Arc<Event>) {
        self.workers.retain(|name, worker| {
            let live = !worker.is_terminated();
            if !live {
                info!(registration = %name, "Reaping stopped worker");
            }
            live
        });

        for worker in self.workers.values() {
            if !worker.deliver(event.clone()).await {
                debug!(registration = %worker.name(), "Worker stopped before hand-off");
            }
        }
    }

    /// Tell every live worker to stop. Does not wait for them.
    ///
    /// Each worker finishes the send it is in, if any, and exits without
    /// touching the events still queued for it.
    pub fn shutdown(&mut self) {
        for (name, worker) in self.workers.drain() {
            if !worker.is_terminated() {
                debug!(registration = %name, "Terminating worker");
                worker.terminate();
            }
        }
    }

    /// Run until a fatal error arrives or the event source closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Arc<Event>>,
        mut notifications: mpsc::Receiver<NotifyUpdate>,
        mut fatal: mpsc::Receiver<FatalError>,
    ) -> Result<(), DispatchError> {
        tokio::select! {
            biased;
            Some(e) = fatal.recv() => {
                error!(error = %e, "Fatal error during startup");
                return Err(DispatchError::Fatal(e));
            }
            _ = self.startup() => {}
        }

        loop {
            tokio::select! {
                biased;

                Some(e) = fatal.recv() => {
                    error!(error = %e, workers = self.workers.len(), "Fatal error, shutting down");
                    self.shutdown();
                    return Err(DispatchError::Fatal(e));
                }

                Some(update) = notifications.recv() => {
                    self.handle_notification(update).await;
                }

                event = events.recv() => match event {
                    Some(event) => self.dispatch_event(event).await,
                    None => {
                        info!("Event source closed, shutting down");
                        self.shutdown();
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests;
