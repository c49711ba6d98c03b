//! Output relay - hands captured lines to the host
//!
//! Pull mode gives the caller the `OutputReceiver` itself. Push mode drains
//! it on a forwarding task that emits one named event per line.

use crate::process::capture::OutputReceiver;
use crate::process::slot::ProcessSlot;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// How captured output of a launch reaches the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Caller drains the returned channel
    Pull,
    /// A forwarding task emits `<slot>_output` events
    Push,
}

/// Output of a started slot, in the shape its delivery mode asked for
#[derive(Debug)]
pub enum Attached {
    Pull(OutputReceiver),
    /// Resolves to the number of lines forwarded once the process output closes
    Push(JoinHandle<usize>),
}

/// Host-side event bus receiving pushed output.
///
/// `emit` may wait for the host to make room. The forwarder awaits it, so a
/// slow host stalls the capture side instead of losing lines.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &str, payload: &str);
}

/// A named event carrying one line of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub name: String,
    pub payload: String,
}

/// Bounded event bus with a single consumer
pub struct EventBus {
    tx: mpsc::Sender<OutputEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events, and the
    /// receiver the host drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: &str, payload: &str) {
        let event = OutputEvent {
            name: event.to_string(),
            payload: payload.to_string(),
        };
        if self.tx.send(event).await.is_err() {
            debug!("Event receiver dropped, discarding output event");
        }
    }
}

/// Drain `output` on a new task, emitting each line as `<slot>_output`.
/// The task ends by itself when the channel closes.
pub fn spawn_forwarder(
    slot: ProcessSlot,
    mut output: OutputReceiver,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let event = slot.event_name();
        let mut forwarded = 0;
        while let Some(line) = output.recv().await {
            sink.emit(event, &line).await;
            forwarded += 1;
        }
        debug!(%slot, forwarded, "Output channel closed, forwarder finished");
        forwarded
    })
}
