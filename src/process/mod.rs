//! Process supervision for the toolbox helper programs

pub mod capture;
pub mod handle;
pub mod registry;
pub mod relay;
pub mod slot;

pub use capture::{CaptureLimits, OutputLine, OutputReceiver};
pub use handle::ProcessHandle;
pub use registry::{ProcessInfo, ProcessRegistry, SlotState};
pub use relay::{Attached, Delivery, EventBus, EventSink, OutputEvent};
pub use slot::ProcessSlot;
