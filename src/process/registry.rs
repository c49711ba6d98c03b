//! Process registry - tracks the process bound to each slot

use crate::config::{SlotCommand, StopSignal};
use crate::error::{LauncherError, Result};
use crate::process::capture::{CaptureLimits, OutputReceiver};
use crate::process::handle::ProcessHandle;
use crate::process::slot::ProcessSlot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Observable lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Empty,
    Running,
    Stopping,
}

/// Snapshot of a bound slot
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub slot: ProcessSlot,
    pub launch_id: Uuid,
    pub pid: Option<u32>,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub state: SlotState,
}

#[derive(Debug)]
struct SlotEntry {
    handle: ProcessHandle,
    state: SlotState,
}

type Slots = Mutex<HashMap<ProcessSlot, SlotEntry>>;

/// Registry holding at most one live process per slot
pub struct ProcessRegistry {
    slots: Arc<Slots>,
    limits: CaptureLimits,
    stop_signal: StopSignal,
}

impl ProcessRegistry {
    pub fn new(limits: CaptureLimits, stop_signal: StopSignal) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            limits,
            stop_signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessSlot, SlotEntry>> {
        lock_slots(&self.slots)
    }

    /// Spawn `command` into an empty slot and return its output channel
    pub fn start(&self, slot: ProcessSlot, command: &SlotCommand) -> Result<OutputReceiver> {
        let mut slots = self.lock();
        if slots.contains_key(&slot) {
            return Err(LauncherError::AlreadyRunning(slot));
        }

        // Spawning under the lock keeps the empty check and the bind atomic
        let registry = Arc::downgrade(&self.slots);
        let (handle, output) = ProcessHandle::spawn(command, self.limits, move |launch_id, _| {
            release_exited(&registry, slot, launch_id);
        })?;

        info!(
            %slot,
            launch_id = %handle.launch_id(),
            pid = ?handle.pid(),
            "Started {}",
            handle.command_line()
        );

        slots.insert(
            slot,
            SlotEntry {
                handle,
                state: SlotState::Running,
            },
        );

        Ok(output)
    }

    /// Signal the slot's process and unbind it. Returns false when the slot
    /// is empty, already stopping, or the signal could not be delivered; in
    /// the last case the binding is kept.
    ///
    /// The slot is free again once the signal is delivered, not once the
    /// process has exited. Use `stop_and_wait` when a child may outlive a
    /// SIGTERM.
    pub async fn stop(&self, slot: ProcessSlot) -> bool {
        let (terminate, launch_id) = {
            let mut slots = self.lock();
            let Some(entry) = slots.get_mut(&slot) else {
                return false;
            };
            if entry.state == SlotState::Stopping {
                return false;
            }
            entry.state = SlotState::Stopping;
            (
                entry.handle.terminate(self.stop_signal),
                entry.handle.launch_id(),
            )
        };

        let result = terminate.await;

        let mut slots = self.lock();
        let bound = slots
            .get(&slot)
            .is_some_and(|entry| entry.handle.launch_id() == launch_id);

        match result {
            Ok(()) => {
                if bound {
                    slots.remove(&slot);
                }
                info!(%slot, %launch_id, "Stopped process");
                true
            }
            Err(e) => {
                error!(%slot, %launch_id, "Failed to terminate process: {e}");
                if bound {
                    if let Some(entry) = slots.get_mut(&slot) {
                        entry.state = SlotState::Running;
                    }
                }
                false
            }
        }
    }

    /// Stop the slot's process and wait up to `timeout` for it to exit
    pub async fn stop_and_wait(&self, slot: ProcessSlot, timeout: Duration) -> Result<bool> {
        let exited = match self.lock().get(&slot) {
            Some(entry) => entry.handle.exited(),
            None => return Err(LauncherError::NotRunning(slot)),
        };

        if !self.stop(slot).await {
            return Ok(false);
        }

        tokio::time::timeout(timeout, exited)
            .await
            .map_err(|_| LauncherError::ExitTimeout { slot, timeout })?;
        Ok(true)
    }

    /// Stop every bound slot, waiting up to `timeout` for each exit
    pub async fn shutdown(&self, timeout: Duration) {
        for slot in self.running_slots() {
            match self.stop_and_wait(slot, timeout).await {
                Ok(true) | Err(LauncherError::NotRunning(_)) => {}
                Ok(false) => warn!(%slot, "Process could not be stopped during shutdown"),
                Err(e) => warn!(%slot, "{e}"),
            }
        }
    }

    pub fn status(&self, slot: ProcessSlot) -> SlotState {
        self.lock()
            .get(&slot)
            .map(|entry| entry.state)
            .unwrap_or(SlotState::Empty)
    }

    /// Slots currently bound to a process, in declaration order
    pub fn running_slots(&self) -> Vec<ProcessSlot> {
        let slots = self.lock();
        ProcessSlot::all()
            .into_iter()
            .filter(|slot| slots.contains_key(slot))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let slots = self.lock();
        ProcessSlot::all()
            .into_iter()
            .filter_map(|slot| {
                slots.get(&slot).map(|entry| ProcessInfo {
                    slot,
                    launch_id: entry.handle.launch_id(),
                    pid: entry.handle.pid(),
                    command: entry.handle.command_line().to_string(),
                    started_at: entry.handle.started_at(),
                    state: entry.state,
                })
            })
            .collect()
    }
}

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<ProcessSlot, SlotEntry>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Return a slot to empty after its process exited on its own. A newer
/// launch bound to the same slot is left alone.
fn release_exited(registry: &Weak<Slots>, slot: ProcessSlot, launch_id: Uuid) {
    let Some(slots) = registry.upgrade() else {
        return;
    };
    let mut slots = lock_slots(&slots);
    if slots
        .get(&slot)
        .is_some_and(|entry| entry.handle.launch_id() == launch_id)
    {
        slots.remove(&slot);
        info!(%slot, %launch_id, "Slot released after process exit");
    }
}
