use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use crate::{device::Presenter, vk};

/// Combined capacity of the pending and completion queues, counted in submit
/// entries. [`SubmissionQueue::submit`] blocks while this many command lists
/// are in flight; presents are exempt from the bound.
///
/// [`SubmissionQueue::submit`]: crate::SubmissionQueue::submit
pub const MAX_QUEUED_SUBMISSIONS: usize = 6;

/// A recorded command list handed over for submission, together with the
/// binary semaphore pair the submission waits on and signals. Null handles
/// mean no semaphore.
pub struct SubmitInfo<C> {
    pub cmd_list: C,
    pub wait_sync: vk::Semaphore,
    pub wake_sync: vk::Semaphore,
}

/// A present request: the presenter to drive and the frame id reported to
/// the latency-marker sink.
pub struct PresentInfo {
    pub presenter: Arc<dyn Presenter>,
    pub frame_id: u64,
}

/// Outcome cell for one queued operation.
///
/// Starts out as `NOT_READY` and is written exactly once by the submitter
/// with the result of the device call, or with `ERROR_DEVICE_LOST` when the
/// pipeline already carries a sticky error. Keep the cell alive until
/// [`SubmissionQueue::synchronize_submission`] returns; entries still queued
/// at shutdown never reach their cells.
///
/// [`SubmissionQueue::synchronize_submission`]: crate::SubmissionQueue::synchronize_submission
#[derive(Debug)]
pub struct SubmitStatus {
    result: AtomicI32,
}

impl SubmitStatus {
    pub fn new() -> SubmitStatus {
        SubmitStatus {
            result: AtomicI32::new(vk::Result::NOT_READY.as_raw()),
        }
    }

    /// The current outcome; `NOT_READY` until the operation has been
    /// dispatched.
    pub fn result(&self) -> vk::Result {
        vk::Result::from_raw(self.result.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        self.result() == vk::Result::NOT_READY
    }

    pub(crate) fn set(&self, result: vk::Result) {
        self.result.store(result.as_raw(), Ordering::Release);
    }
}

impl Default for SubmitStatus {
    fn default() -> SubmitStatus {
        SubmitStatus::new()
    }
}

/// One slot of the pipeline.
///
/// The payload is taken out of the slot while the entry is being processed,
/// and the emptied slot stays at the front of its queue until processing
/// finishes. Queue emptiness therefore still reflects in-flight work, which
/// is what `synchronize` waiters observe.
pub(crate) struct Entry<C> {
    pub payload: Option<Payload<C>>,
    pub status: Option<Arc<SubmitStatus>>,
}

pub(crate) enum Payload<C> {
    Submit(SubmitInfo<C>),
    Present(PresentInfo),
}

impl<C> Default for Entry<C> {
    fn default() -> Entry<C> {
        Entry {
            payload: None,
            status: None,
        }
    }
}
