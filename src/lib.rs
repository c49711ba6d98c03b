//! Toolbox launcher library - supervises helper processes and streams their output

pub mod config;
pub mod error;
pub mod launcher;
pub mod process;

// Re-export commonly used types
pub use config::{Config, SlotCommand, StopSignal};
pub use error::{LauncherError, Result};
pub use launcher::{Launcher, SlotSelection};
pub use process::{
    Attached, Delivery, EventBus, EventSink, OutputEvent, OutputReceiver, ProcessSlot, SlotState,
};
