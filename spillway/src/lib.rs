mod device;
mod error;
mod queue;
mod types;

// --- reexports ---
pub use ash::{self, vk};

pub use device::{CommandList, CrashDumpStatus, Device, DeviceConfig, LatencyMarker, Presenter};
pub use error::Error;
pub use queue::{DeviceQueueGuard, SubmissionQueue};
pub use types::{PresentInfo, SubmitInfo, SubmitStatus, MAX_QUEUED_SUBMISSIONS};
