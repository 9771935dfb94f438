//! Two-stage dispatch of recorded command lists to the device queue
//! (`vkQueueSubmit`, presentation) and recycling of finished command lists.

use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use ash::prelude::VkResult;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, trace_span};

use crate::{
    device::{CommandList, CrashDumpStatus, Device, LatencyMarker},
    types::{Entry, Payload, PresentInfo, SubmitInfo, SubmitStatus, MAX_QUEUED_SUBMISSIONS},
    vk, Error,
};

/// How long a failed submission waits for the crash-dump writer, and how
/// often it polls while waiting.
const CRASH_DUMP_WAIT_BUDGET: Duration = Duration::from_millis(5000);
const CRASH_DUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dispatches recorded command lists and present requests to the device
/// queue, in the order they were enqueued, and recycles command lists once
/// the GPU has finished with them.
///
/// Two worker threads do the actual work: the submitter performs the device
/// calls, the finisher waits on fences and hands command lists back to the
/// device. Producers only ever enqueue; errors surface through
/// [`SubmitStatus`] cells and [`SubmissionQueue::last_error`], never as
/// return values of `submit` or `present`.
pub struct SubmissionQueue<D: Device> {
    shared: Arc<Shared<D>>,
    submit_thread: Option<thread::JoinHandle<()>>,
    finish_thread: Option<thread::JoinHandle<()>>,
}

/// Exclusive access to the device queue, excluding the submitter thread.
/// The queue is unlocked when the guard is dropped.
#[must_use = "the device queue is unlocked when the guard is dropped"]
pub struct DeviceQueueGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

struct Queues<C> {
    /// Entries awaiting submission, in enqueue order.
    pending: VecDeque<Entry<C>>,
    /// Successfully submitted entries awaiting GPU completion. Only submit
    /// entries ever enter; presents have no completion step.
    completed: VecDeque<Entry<C>>,
}

struct Shared<D: Device> {
    device: Arc<D>,

    queues: Mutex<Queues<D::CommandList>>,
    /// Producer -> submitter: an entry was appended.
    append_cond: Condvar,
    /// Submitter -> finisher and `synchronize*` waiters: an entry was
    /// dispatched (or failed).
    submit_cond: Condvar,
    /// Finisher -> backpressured producers: a submission slot was freed.
    finish_cond: Condvar,

    /// Serializes access to the device queue. Never held together with
    /// `queues`; external code can hold it through `lock_device_queue`
    /// without blocking producers.
    queue_mutex: Mutex<()>,

    stopped: AtomicBool,
    /// Raw `vk::Result` of the first failure, `SUCCESS` until then. Sticky:
    /// once set, no further device-queue calls are made.
    last_error: AtomicI32,
    /// Number of submit entries between enqueue and recycle.
    pending_count: AtomicU32,
    /// Accumulated time the finisher spent waiting on an empty completion
    /// queue, in microseconds.
    gpu_idle_us: AtomicU64,
}

impl<D: Device> SubmissionQueue<D> {
    /// Creates the queue and spawns its two worker threads.
    pub fn new(device: Arc<D>) -> Result<SubmissionQueue<D>, Error> {
        let shared = Arc::new(Shared {
            device,
            queues: Mutex::new(Queues {
                pending: VecDeque::new(),
                completed: VecDeque::new(),
            }),
            append_cond: Condvar::new(),
            submit_cond: Condvar::new(),
            finish_cond: Condvar::new(),
            queue_mutex: Mutex::new(()),
            stopped: AtomicBool::new(false),
            last_error: AtomicI32::new(vk::Result::SUCCESS.as_raw()),
            pending_count: AtomicU32::new(0),
            gpu_idle_us: AtomicU64::new(0),
        });

        let submit_thread = thread::Builder::new().name("spillway-submit".to_string()).spawn({
            let shared = shared.clone();
            move || shared.run_submitter()
        })?;
        let finish_thread = thread::Builder::new().name("spillway-finish".to_string()).spawn({
            let shared = shared.clone();
            move || shared.run_finisher()
        })?;

        Ok(SubmissionQueue {
            shared,
            submit_thread: Some(submit_thread),
            finish_thread: Some(finish_thread),
        })
    }

    /// Returns the device this queue submits to.
    pub fn device(&self) -> &Arc<D> {
        &self.shared.device
    }

    /// Enqueues a command list for submission.
    ///
    /// Blocks while [`MAX_QUEUED_SUBMISSIONS`] command lists are already in
    /// flight; this is the only backpressure point in the pipeline and
    /// bounds the command-buffer memory held by queued work. Errors do not
    /// surface here — poll [`last_error`](Self::last_error) or attach
    /// completion callbacks to the command list.
    pub fn submit(&self, submit: SubmitInfo<D::CommandList>) {
        let shared = &*self.shared;
        let mut queues = shared.queues.lock();

        shared.finish_cond.wait_while(&mut queues, |_| {
            shared.pending_count.load(Ordering::Relaxed) as usize >= MAX_QUEUED_SUBMISSIONS
        });

        shared.pending_count.fetch_add(1, Ordering::Relaxed);
        queues.pending.push_back(Entry {
            payload: Some(Payload::Submit(submit)),
            status: None,
        });
        shared.append_cond.notify_all();
    }

    /// Enqueues a present request.
    ///
    /// Never blocks on backpressure: a present held back by command-buffer
    /// accounting would deadlock the frame, since the command lists whose
    /// completion would free a slot have not been synchronized yet.
    ///
    /// The status cell is the only completion signal for a present; there is
    /// no completion step and no completion callbacks. If the queue is shut
    /// down before the present is dispatched, the cell stays `NOT_READY`.
    pub fn present(&self, present: PresentInfo, status: Arc<SubmitStatus>) {
        let shared = &*self.shared;
        let mut queues = shared.queues.lock();

        queues.pending.push_back(Entry {
            payload: Some(Payload::Present(present)),
            status: Some(status),
        });
        shared.append_cond.notify_all();
    }

    /// Blocks until the submitter has written an outcome into `status`.
    pub fn synchronize_submission(&self, status: &SubmitStatus) {
        let shared = &*self.shared;
        let mut queues = shared.queues.lock();
        shared
            .submit_cond
            .wait_while(&mut queues, |_| status.is_pending());
    }

    /// Blocks until every entry enqueued before this call has been handed to
    /// the device queue (or failed). This does not wait for GPU completion;
    /// use a [`SubmitStatus`] or command-list callbacks for that.
    pub fn synchronize(&self) {
        let shared = &*self.shared;
        let mut queues = shared.queues.lock();
        shared
            .submit_cond
            .wait_while(&mut queues, |q| !q.pending.is_empty());
    }

    /// Locks the device queue for out-of-band use, e.g. a window-system
    /// present issued directly by the caller. The submitter takes the same
    /// lock around every device call, so it stalls until the guard is
    /// dropped; enqueueing is unaffected.
    pub fn lock_device_queue(&self) -> DeviceQueueGuard<'_> {
        DeviceQueueGuard {
            _guard: self.shared.queue_mutex.lock(),
        }
    }

    /// Number of submit entries between enqueue and recycle.
    pub fn pending_count(&self) -> u32 {
        self.shared.pending_count.load(Ordering::Relaxed)
    }

    /// Accumulated time the finisher spent waiting for work, in
    /// microseconds. A proxy for how long the GPU sat idle.
    pub fn gpu_idle_us(&self) -> u64 {
        self.shared.gpu_idle_us.load(Ordering::Relaxed)
    }

    /// The sticky error: `SUCCESS` until a submission or fence sync fails,
    /// the failing result afterwards. Once non-`SUCCESS`, every subsequent
    /// entry is failed with `ERROR_DEVICE_LOST` without touching the device.
    pub fn last_error(&self) -> vk::Result {
        self.shared.last_error()
    }

    /// `Result`-shaped view of [`last_error`](Self::last_error).
    pub fn check_last_error(&self) -> Result<(), Error> {
        match self.last_error() {
            vk::Result::SUCCESS => Ok(()),
            err => Err(Error::Vulkan(err)),
        }
    }
}

impl<D: Device> Drop for SubmissionQueue<D> {
    /// Stops both workers and joins them. Entries still queued are dropped
    /// unprocessed: their status cells stay `NOT_READY` and their completion
    /// callbacks never fire. Callers must not still be blocked in
    /// `synchronize_submission` when the queue is dropped.
    fn drop(&mut self) {
        {
            let _queues = self.shared.queues.lock();
            self.shared.stopped.store(true, Ordering::Release);
        }
        self.shared.append_cond.notify_all();
        self.shared.submit_cond.notify_all();

        if let Some(thread) = self.submit_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.finish_thread.take() {
            let _ = thread.join();
        }
    }
}

impl<D: Device> Shared<D> {
    fn last_error(&self) -> vk::Result {
        vk::Result::from_raw(self.last_error.load(Ordering::Acquire))
    }

    fn set_last_error(&self, error: vk::Result) {
        self.last_error.store(error.as_raw(), Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Submitter loop: take the head of the pending queue, perform the
    /// device call, and on success pass the entry on to the finisher.
    fn run_submitter(&self) {
        let mut queues = self.queues.lock();

        while !self.stopped() {
            {
                let _span = trace_span!("Waiting for submissions").entered();
                self.append_cond
                    .wait_while(&mut queues, |q| !self.stopped() && q.pending.is_empty());
            }

            if self.stopped() {
                return;
            }

            // Move the head out but leave the emptied slot in place: the pop
            // happens after the device call, so `synchronize` waiters see
            // in-flight work as a non-empty pending queue.
            let Some(front) = queues.pending.front_mut() else {
                continue;
            };
            let mut entry = mem::take(front);

            // The device call happens outside the global lock.
            drop(queues);

            let status = if self.last_error() != vk::Result::SUCCESS {
                // Don't submit anything once an error is sticky, so that
                // drivers get a chance to recover and write their dump.
                vk::Result::ERROR_DEVICE_LOST
            } else {
                let _queue_lock = self.queue_mutex.lock();

                match entry.payload {
                    Some(Payload::Submit(ref mut submit)) => {
                        vk_status(submit.cmd_list.submit(submit.wait_sync, submit.wake_sync))
                    }
                    Some(Payload::Present(ref present)) => {
                        self.device
                            .set_latency_marker(present.frame_id, LatencyMarker::PresentStart);
                        let status = vk_status(present.presenter.present_image());
                        self.device
                            .set_latency_marker(present.frame_id, LatencyMarker::PresentEnd);

                        let delay = self.device.config().present_throttle_delay;
                        if delay > 0 {
                            // Pacing of the device queue itself; the sleep
                            // must stay inside the critical section.
                            thread::sleep(Duration::from_millis(u64::from(delay)));
                        }
                        status
                    }
                    // Emptied slots never leave the queue front.
                    None => vk::Result::SUCCESS,
                }
            };

            if let Some(cell) = &entry.status {
                cell.set(status);
            }

            queues = self.queues.lock();

            let is_submit = matches!(entry.payload, Some(Payload::Submit(_)));
            if status == vk::Result::SUCCESS {
                if is_submit {
                    queues.completed.push_back(entry);
                }
            } else if status == vk::Result::ERROR_DEVICE_LOST || is_submit {
                error!("command submission failed: {}", status);
                self.set_last_error(status);

                if self.device.config().enable_crash_dumps {
                    self.wait_for_crash_dump();
                }
                self.device.wait_for_idle();

                if is_submit {
                    // The entry never reaches the finisher; release its
                    // submission slot here so backpressured producers and
                    // the pending count stay consistent while draining.
                    self.pending_count.fetch_sub(1, Ordering::Relaxed);
                    self.finish_cond.notify_all();
                }
            }
            // A failing present that did not lose the device is dropped
            // here; its status cell already carries the result.

            queues.pending.pop_front();
            self.submit_cond.notify_all();
        }
    }

    /// Finisher loop: wait for the GPU to finish the head of the completion
    /// queue, fire its callbacks and hand the command list back to the
    /// device.
    fn run_finisher(&self) {
        let mut queues = self.queues.lock();

        while !self.stopped() {
            if queues.completed.is_empty() {
                let idle_start = Instant::now();
                {
                    let _span = trace_span!("Waiting for submitted command lists").entered();
                    self.submit_cond
                        .wait_while(&mut queues, |q| !self.stopped() && q.completed.is_empty());
                }
                self.gpu_idle_us
                    .fetch_add(idle_start.elapsed().as_micros() as u64, Ordering::Relaxed);
            }

            if self.stopped() {
                return;
            }

            let Some(front) = queues.completed.front_mut() else {
                continue;
            };
            let mut entry = mem::take(front);

            // The fence wait happens outside the global lock. The finisher
            // never touches the device queue, so it does not contend with
            // `lock_device_queue` holders.
            drop(queues);

            if let Some(Payload::Submit(mut submit)) = entry.payload.take() {
                let mut status = self.last_error();
                if status != vk::Result::ERROR_DEVICE_LOST {
                    status = vk_status(submit.cmd_list.synchronize());
                }

                if status != vk::Result::SUCCESS {
                    error!("failed to synchronize command list: {}", status);
                    self.set_last_error(status);
                    self.device.wait_for_idle();
                }

                submit.cmd_list.notify_signals();
                submit.cmd_list.reset();
                self.device.recycle_command_list(submit.cmd_list);
            }

            queues = self.queues.lock();
            self.pending_count.fetch_sub(1, Ordering::Relaxed);
            queues.completed.pop_front();
            self.finish_cond.notify_all();
        }
    }

    /// Stalls until the crash-dump writer reports completion (or reports
    /// nothing useful), so a pending dump is not cut short by teardown.
    fn wait_for_crash_dump(&self) {
        let deadline = Instant::now() + CRASH_DUMP_WAIT_BUDGET;
        while Instant::now() < deadline {
            match self.device.crash_dump_status() {
                CrashDumpStatus::Finished | CrashDumpStatus::Unknown => break,
                CrashDumpStatus::NotStarted | CrashDumpStatus::Collecting => {
                    thread::sleep(CRASH_DUMP_POLL_INTERVAL);
                }
            }
        }
    }
}

fn vk_status(result: VkResult<()>) -> vk::Result {
    match result {
        Ok(()) => vk::Result::SUCCESS,
        Err(err) => err,
    }
}
