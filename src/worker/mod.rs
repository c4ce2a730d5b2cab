//! Registration workers.
//!
//! Each registration runs as its own tokio task owning one [`Pipeline`]:
//!
//! ```text
//! events ──→ filter* ──→ format ──→ compress? ──→ encrypt? ──→ send ──→ mark pushed?
//! ```
//!
//! A worker listens on two channels. The control channel carries a
//! replacement registration or a terminate request and is always polled
//! first. The event channel is bounded, so a slow sink pushes back on the
//! dispatch loop.
//!
//! A worker whose rebuild fails exits. Its channels close with it, which is
//! how the dispatch loop learns to reap it.

use std::borrow::Cow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clients::EventPusher;
use crate::keys::KeyDecrypter;
use crate::models::{Event, Registration};
use crate::pipeline::{
    Compression, Encryption, Filter, Filterer, Format, Formatter, StageError, Transformer,
};
use crate::sender::{Sender, SenderError, SenderFactory};

/// Capacity of a worker's control channel.
const CONTROL_CAPACITY: usize = 4;

/// Errors rejecting a registration at build time.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("registration has no name")]
    MissingName,

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Sender(#[from] SenderError),
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub keys: Arc<dyn KeyDecrypter>,
    pub senders: Arc<dyn SenderFactory>,
    /// Upstream store notified after successful delivery. `None` disables it.
    pub pusher: Option<Arc<dyn EventPusher>>,
    /// Capacity of each worker's event channel.
    pub event_buffer: usize,
}

impl WorkerContext {
    pub fn new(keys: Arc<dyn KeyDecrypter>, senders: Arc<dyn SenderFactory>) -> Self {
        Self {
            keys,
            senders,
            pusher: None,
            event_buffer: 1,
        }
    }

    pub fn with_pusher(mut self, pusher: Arc<dyn EventPusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }
}

/// The resolved stage set of one registration.
pub struct Pipeline {
    filters: Vec<Filter>,
    format: Format,
    compression: Option<Compression>,
    encryption: Option<Encryption>,
    sender: Box<dyn Sender>,
}

impl Pipeline {
    /// Resolve every stage from the registration's fields.
    ///
    /// Unsupported enum values, bad key material and sender configuration
    /// errors all reject the build. Nothing connects here.
    pub fn build(registration: &Registration, ctx: &WorkerContext) -> Result<Self, BuildError> {
        if registration.name.is_empty() {
            return Err(BuildError::MissingName);
        }

        let filters = Filter::chain(&registration.filter);
        let format = Format::from_export_format(&registration.format)?;
        let compression = Compression::from_type(&registration.compression)?;
        let encryption = Encryption::from_details(&registration.encryption)?;
        let sender = ctx.senders.build(registration, ctx.keys.as_ref())?;

        Ok(Self {
            filters,
            format,
            compression,
            encryption,
            sender,
        })
    }

    /// Run the filter chain. `None` means the event was rejected.
    pub fn filter<'a>(&self, event: &'a Event) -> Option<Cow<'a, Event>> {
        self.filters
            .iter()
            .try_fold(Cow::Borrowed(event), |current, f| f.filter(current))
    }

    /// Format, then compress, then encrypt.
    pub fn encode(&self, event: &Event) -> Result<Vec<u8>, StageError> {
        let mut payload = self.format.format(event);
        if let Some(compression) = &self.compression {
            payload = compression.transform(&payload)?;
        }
        if let Some(encryption) = &self.encryption {
            payload = encryption.transform(&payload)?;
        }
        Ok(payload)
    }

    pub fn protocol(&self) -> &'static str {
        self.sender.protocol()
    }
}

/// Outcome of offering one event to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The registration is disabled.
    Disabled,
    /// A filter rejected the event.
    Filtered,
    /// Encoding or sending failed. The event is dropped for this sink.
    Failed,
    Delivered,
}

/// Messages on a worker's control channel.
#[derive(Debug)]
pub enum WorkerControl {
    /// Rebuild the pipeline from a fresh registration.
    Update(Box<Registration>),
    /// Exit without draining queued events.
    Terminate,
}

/// One registration's pipeline and the state needed to rebuild it.
pub struct RegistrationWorker {
    registration: Registration,
    pipeline: Pipeline,
    ctx: WorkerContext,
}

impl RegistrationWorker {
    pub fn build(registration: Registration, ctx: WorkerContext) -> Result<Self, BuildError> {
        let pipeline = Pipeline::build(&registration, &ctx)?;
        Ok(Self {
            registration,
            pipeline,
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.registration.name
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Replace the whole stage set.
    ///
    /// The new pipeline is built before anything is swapped, so on error the
    /// worker still holds its previous registration and pipeline intact.
    pub fn update(&mut self, registration: Registration) -> Result<(), BuildError> {
        let pipeline = Pipeline::build(&registration, &self.ctx)?;
        self.pipeline = pipeline;
        self.registration = registration;
        Ok(())
    }

    /// Push one event through the pipeline.
    pub async fn process_event(&mut self, event: &Event) -> Delivery {
        if !self.registration.enable {
            return Delivery::Disabled;
        }

        let Some(filtered) = self.pipeline.filter(event) else {
            debug!(registration = %self.registration.name, device = %event.device, "Event filtered");
            return Delivery::Filtered;
        };

        let payload = match self.pipeline.encode(&filtered) {
            Ok(payload) if !payload.is_empty() => payload,
            Ok(_) => {
                warn!(registration = %self.registration.name, event_id = %event.id, "Formatter produced an empty payload");
                return Delivery::Failed;
            }
            Err(e) => {
                error!(registration = %self.registration.name, event_id = %event.id, error = %e, "Failed to encode event");
                return Delivery::Failed;
            }
        };

        if !self.pipeline.sender.send(&payload, &filtered).await {
            warn!(
                registration = %self.registration.name,
                protocol = self.pipeline.protocol(),
                event_id = %event.id,
                "Event not delivered"
            );
            return Delivery::Failed;
        }

        debug!(registration = %self.registration.name, event_id = %event.id, bytes = payload.len(), "Event delivered");
        self.mark_pushed(event);
        Delivery::Delivered
    }

    /// Fire-and-forget acknowledgement to the upstream store.
    fn mark_pushed(&self, event: &Event) {
        let Some(pusher) = self.ctx.pusher.clone() else {
            return;
        };
        if event.id.is_empty() {
            return;
        }

        let event_id = event.id.clone();
        let registration = self.registration.name.clone();
        tokio::spawn(async move {
            if let Err(e) = pusher.mark_pushed(&event_id).await {
                warn!(registration = %registration, event_id = %event_id, error = %e, "Failed to mark event pushed");
            }
        });
    }

    /// Start the worker task.
    pub fn spawn(self) -> WorkerHandle {
        let name = self.registration.name.clone();
        let (events_tx, events_rx) = mpsc::channel(self.ctx.event_buffer.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        info!(
            registration = %name,
            protocol = self.pipeline.protocol(),
            enabled = self.registration.enable,
            "Worker started"
        );
        let task = tokio::spawn(self.run(events_rx, control_rx));

        WorkerHandle {
            name,
            events: events_tx,
            control: control_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<Arc<Event>>,
        mut control: mpsc::Receiver<WorkerControl>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(message) = control.recv() => match message {
                    WorkerControl::Update(registration) => {
                        if let Err(e) = self.update(*registration) {
                            error!(registration = %self.registration.name, error = %e, "Rebuild rejected, stopping worker");
                            break;
                        }
                        info!(registration = %self.registration.name, "Worker rebuilt");
                    }
                    WorkerControl::Terminate => break,
                },

                event = events.recv() => match event {
                    Some(event) => {
                        self.process_event(&event).await;
                    }
                    None => break,
                },
            }
        }

        info!(registration = %self.registration.name, "Worker stopped");
    }
}

/// The dispatch loop's side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    events: mpsc::Sender<Arc<Event>>,
    control: mpsc::Sender<WorkerControl>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the worker task has exited.
    pub fn is_terminated(&self) -> bool {
        self.events.is_closed() || self.task.is_finished()
    }

    /// Hand an event to the worker, waiting for channel capacity.
    ///
    /// Returns `false` if the worker has exited.
    pub async fn deliver(&self, event: Arc<Event>) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Queue a rebuild. Returns `false` if the worker has exited.
    pub async fn update(&self, registration: Registration) -> bool {
        self.control
            .send(WorkerControl::Update(Box::new(registration)))
            .await
            .is_ok()
    }

    /// Ask the worker to exit without waiting for it.
    ///
    /// If the control channel is full the request is dropped. Dropping the
    /// handle closes both channels, which stops the worker anyway.
    pub fn terminate(&self) {
        if self.control.try_send(WorkerControl::Terminate).is_err() {
            debug!(registration = %self.name, "Terminate not queued");
        }
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) {
        let WorkerHandle { name, task, .. } = self;
        if let Err(e) = task.await {
            error!(registration = %name, error = %e, "Worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests;
