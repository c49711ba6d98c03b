//! Launcher - the host-facing surface over the process registry

use crate::config::{Config, SlotCommand};
use crate::error::{LauncherError, Result};
use crate::process::relay::{self, Attached, Delivery, EventSink};
use crate::process::{OutputReceiver, ProcessInfo, ProcessRegistry, ProcessSlot, SlotState};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

/// A slot and whether it should be started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSelection {
    pub slot: ProcessSlot,
    pub enabled: bool,
}

impl SlotSelection {
    pub fn new(slot: ProcessSlot, enabled: bool) -> Self {
        Self { slot, enabled }
    }
}

#[derive(Serialize)]
struct Stats<'a> {
    skin: Option<&'a str>,
    processes: Vec<ProcessInfo>,
}

pub struct Launcher {
    config: Config,
    registry: ProcessRegistry,
    sink: Arc<dyn EventSink>,
    skin: Mutex<Option<String>>,
}

impl Launcher {
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Self {
        let registry = ProcessRegistry::new(config.capture_limits(), config.stop_signal);
        Self {
            config,
            registry,
            sink,
            skin: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start an arbitrary command in the named slot, pull mode
    pub fn start(&self, slot: &str, command: &SlotCommand) -> Result<OutputReceiver> {
        let slot: ProcessSlot = slot.parse()?;
        self.registry.start(slot, command)
    }

    /// Start the slot's configured command and deliver its output as asked
    pub fn launch(&self, slot: ProcessSlot, delivery: Delivery) -> Result<Attached> {
        let output = self.registry.start(slot, self.config.command_for(slot))?;
        Ok(match delivery {
            Delivery::Pull => Attached::Pull(output),
            Delivery::Push => {
                Attached::Push(relay::spawn_forwarder(slot, output, Arc::clone(&self.sink)))
            }
        })
    }

    /// Start the named slot's configured command and return its output channel
    pub fn watch_output(&self, slot: &str) -> Result<OutputReceiver> {
        let slot: ProcessSlot = slot.parse()?;
        self.registry.start(slot, self.config.command_for(slot))
    }

    /// Start every enabled selection in order. Stops at the first failure;
    /// slots started before it keep running.
    pub fn start_many(
        &self,
        selections: &[SlotSelection],
        delivery: Delivery,
    ) -> Result<Vec<(ProcessSlot, Attached)>> {
        let mut started = Vec::new();
        for selection in selections.iter().filter(|s| s.enabled) {
            let attached = self.launch(selection.slot, delivery)?;
            started.push((selection.slot, attached));
        }
        Ok(started)
    }

    /// Start the enabled services in push mode, emitting `skin_output` and
    /// `helper_output` events through the sink
    pub fn start_services(&self, enable_skin: bool, enable_helper: bool) -> Result<()> {
        let selections = [
            SlotSelection::new(ProcessSlot::Skin, enable_skin),
            SlotSelection::new(ProcessSlot::Helper, enable_helper),
        ];
        let started = self.start_many(&selections, Delivery::Push)?;
        info!(count = started.len(), "Services started");
        Ok(())
    }

    pub async fn stop(&self, slot: ProcessSlot) -> bool {
        self.registry.stop(slot).await
    }

    /// Stop by slot name; unknown names are simply not running
    pub async fn stop_process(&self, slot: &str) -> bool {
        match slot.parse::<ProcessSlot>() {
            Ok(slot) => self.stop(slot).await,
            Err(_) => false,
        }
    }

    pub async fn stop_and_wait(&self, slot: ProcessSlot, timeout: Duration) -> Result<bool> {
        self.registry.stop_and_wait(slot, timeout).await
    }

    /// Stop everything, waiting up to the configured timeout per process
    pub async fn shutdown(&self) {
        self.registry.shutdown(self.config.stop_timeout()).await;
    }

    pub fn status(&self, slot: ProcessSlot) -> SlotState {
        self.registry.status(slot)
    }

    pub fn running_slots(&self) -> Vec<ProcessSlot> {
        self.registry.running_slots()
    }

    /// Record the skin selected by the host. Running processes are untouched.
    pub fn set_skin(&self, name: &str) -> Result<()> {
        validate_skin_name(name)?;
        *self.skin.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
        info!(skin = name, "Skin selected");
        Ok(())
    }

    pub fn current_skin(&self) -> Option<String> {
        self.skin.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// JSON status of the selected skin and every bound slot
    pub fn get_stats(&self) -> Result<String> {
        let skin = self.current_skin();
        let stats = Stats {
            skin: skin.as_deref(),
            processes: self.registry.snapshot(),
        };
        Ok(serde_json::to_string(&stats)?)
    }
}

/// Validate skin name only contains safe characters
fn validate_skin_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(LauncherError::InvalidSkinName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::EventBus;

    fn launcher() -> Launcher {
        let (bus, _events) = EventBus::new(16);
        Launcher::new(Config::default(), Arc::new(bus))
    }

    #[test]
    fn test_validate_skin_name() {
        assert!(validate_skin_name("default").is_ok());
        assert!(validate_skin_name("summer-2024_v2").is_ok());
        assert!(validate_skin_name("").is_err());
        assert!(validate_skin_name("foo; rm -rf /").is_err());
        assert!(validate_skin_name("../skins").is_err());
    }

    #[test]
    fn test_set_skin_records_valid_names_only() {
        let launcher = launcher();
        assert_eq!(launcher.current_skin(), None);

        launcher.set_skin("sakura").unwrap();
        assert_eq!(launcher.current_skin().as_deref(), Some("sakura"));

        let err = launcher.set_skin("bad name").unwrap_err();
        assert!(matches!(err, LauncherError::InvalidSkinName(_)));
        assert_eq!(launcher.current_skin().as_deref(), Some("sakura"));
    }

    #[test]
    fn test_get_stats_when_idle() {
        let launcher = launcher();
        let stats: serde_json::Value =
            serde_json::from_str(&launcher.get_stats().unwrap()).unwrap();
        assert_eq!(stats["skin"], serde_json::Value::Null);
        assert_eq!(stats["processes"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_unknown_slot_is_rejected() {
        let launcher = launcher();
        let err = launcher.watch_output("unknown").unwrap_err();
        assert!(matches!(err, LauncherError::UnknownSlot(ref name) if name == "unknown"));
        assert!(launcher.running_slots().is_empty());
        assert!(!launcher.stop_process("unknown").await);
    }
}
