//! Ports consumed from the device layer.
//!
//! The submission queue never talks to Vulkan directly; everything it needs
//! from the device side is injected through the traits in this module.

use ash::prelude::VkResult;

use crate::vk;

/// Device-level settings the submission queue acts on.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceConfig {
    /// Extra delay, in milliseconds, inserted after every present while the
    /// device queue is still held. Zero disables the delay.
    pub present_throttle_delay: u32,
    /// Whether a vendor crash-dump writer is attached to the device. When
    /// set, a failed submission stalls until the dump has been written, up
    /// to a fixed budget.
    pub enable_crash_dumps: bool,
}

/// Latency markers reported around presentation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LatencyMarker {
    PresentStart,
    PresentEnd,
}

/// Progress of the vendor crash-dump writer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CrashDumpStatus {
    NotStarted,
    Collecting,
    Finished,
    Unknown,
}

/// A recorded command list with attached wait/signal semaphores and
/// completion callbacks.
///
/// The submission queue owns the command list exclusively from the moment it
/// is enqueued until the device recycles it.
pub trait CommandList: Send + 'static {
    /// Enqueues the command list onto the device queue. The caller holds the
    /// device-queue lock for the duration of the call.
    fn submit(&mut self, wait_sync: vk::Semaphore, wake_sync: vk::Semaphore) -> VkResult<()>;

    /// Blocks until the GPU has finished executing the command list.
    fn synchronize(&mut self) -> VkResult<()>;

    /// Fires the completion callbacks attached to the command list.
    fn notify_signals(&mut self);

    /// Resets the command list for reuse.
    fn reset(&mut self);
}

/// The device that owns the queue being submitted to.
pub trait Device: Send + Sync + 'static {
    type CommandList: CommandList;

    fn config(&self) -> DeviceConfig;

    /// Waits for all work on the device to complete.
    fn wait_for_idle(&self);

    /// Returns a finished command list to the device's pool.
    fn recycle_command_list(&self, cmd_list: Self::CommandList);

    /// Reports a latency marker for the given frame. Devices without a
    /// latency sink keep the default no-op.
    fn set_latency_marker(&self, frame_id: u64, marker: LatencyMarker) {
        let _ = (frame_id, marker);
    }

    /// Progress of the crash-dump writer, polled after a failed submission.
    /// Only consulted when [`DeviceConfig::enable_crash_dumps`] is set.
    fn crash_dump_status(&self) -> CrashDumpStatus {
        CrashDumpStatus::Unknown
    }
}

/// Drives the window-system swap chain.
pub trait Presenter: Send + Sync {
    /// Queues presentation of the current image.
    fn present_image(&self) -> VkResult<()>;
}
