//! USB event loop
//!
//! A dedicated thread per context collects backend completions, enforces
//! transfer deadlines and runs completion callbacks. It is the only place a
//! transfer leaves the pending set, so every transfer reaches exactly one
//! terminal state and its callback runs at most once.
//!
//! Other threads talk to the loop through a command channel and wake the
//! backend so a blocked wait notices the command.

use crate::backend::{
    BackendCompletion, BackendError, BackendIsoPacket, BackendStatus, BackendTransfer, HostBackend,
};
use crate::device::Device;
use crate::error::{Result, UsbError};
use crate::handle::{HandleEntry, HandleId};
use crate::transfer::{
    CompletedTransfer, CompletionCallback, IsoPacketResult, Transfer, TransferId, TransferKind,
    TransferStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Why a transfer is being cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Requested,
    TimedOut,
    HandleClosed,
    Shutdown,
}

pub(crate) enum LoopCommand {
    Cancel { id: TransferId, reason: CancelReason },
    Shutdown,
}

struct PendingTransfer {
    handle: HandleId,
    device: Device,
    endpoint: u8,
    kind: TransferKind,
    deadline: Option<Instant>,
    /// False until the backend accepted the transfer
    submitted: bool,
    cancel: Option<CancelReason>,
    callback: CompletionCallback,
}

pub(crate) struct EventLoop {
    backend: Arc<dyn HostBackend>,
    pending: Mutex<HashMap<TransferId, PendingTransfer>>,
    /// Signalled whenever a transfer leaves the pending set
    settled: Condvar,
    command_tx: async_channel::Sender<LoopCommand>,
    command_rx: async_channel::Receiver<LoopCommand>,
    next_id: AtomicU64,
    running: AtomicBool,
    loop_thread: OnceLock<ThreadId>,
    poll_interval: Duration,
    shutdown_drain: Duration,
}

impl EventLoop {
    pub(crate) fn new(
        backend: Arc<dyn HostBackend>,
        poll_interval: Duration,
        shutdown_drain: Duration,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = async_channel::unbounded();
        Arc::new(Self {
            backend,
            pending: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            command_tx,
            command_rx,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            loop_thread: OnceLock::new(),
            poll_interval,
            shutdown_drain,
        })
    }

    /// Start the loop thread
    pub(crate) fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let event_loop = self.clone();
        thread::Builder::new()
            .name("usb-event-loop".to_string())
            .spawn(move || event_loop.run())
            .map_err(|e| {
                UsbError::HostControllerUnavailable(format!("failed to spawn event loop: {}", e))
            })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<TransferId, PendingTransfer>> {
        // Callbacks run outside the lock, so poisoning leaves the map intact
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub(crate) fn is_pending(&self, id: TransferId) -> bool {
        self.pending().contains_key(&id)
    }

    fn send(&self, command: LoopCommand) {
        if self.command_tx.try_send(command).is_err() {
            warn!("Event loop command channel closed");
        }
        self.backend.wake();
    }

    /// Register a validated transfer and hand it to the backend
    pub(crate) fn submit(
        &self,
        entry: &HandleEntry,
        transfer: Transfer,
        callback: CompletionCallback,
    ) -> Result<TransferId> {
        if !self.is_running() {
            return Err(UsbError::InternalHostError(
                "event loop is shut down".to_string(),
            ));
        }

        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = (!transfer.timeout.is_zero()).then(|| Instant::now() + transfer.timeout);

        self.pending().insert(
            id,
            PendingTransfer {
                handle: entry.id,
                device: entry.device.clone(),
                endpoint: transfer.endpoint,
                kind: transfer.kind.clone(),
                deadline,
                submitted: false,
                cancel: None,
                callback,
            },
        );

        trace!(
            "Submitting {} on {} endpoint {:#04x} ({} bytes)",
            id,
            entry.id,
            transfer.endpoint,
            transfer.buffer.len()
        );

        let result = self.backend.submit(BackendTransfer {
            token: id,
            handle: entry.backend_handle,
            endpoint: transfer.endpoint,
            kind: transfer.kind,
            buffer: transfer.buffer,
            timeout: transfer.timeout,
        });

        if let Err(e) = result {
            self.pending().remove(&id);
            self.settled.notify_all();
            return Err(entry.backend_error(e));
        }

        // A cancel or timeout that raced the submission is forwarded now
        let cancel_now = match self.pending().get_mut(&id) {
            Some(p) => {
                p.submitted = true;
                p.cancel.is_some()
            }
            None => false,
        };
        if cancel_now {
            self.backend.cancel(id);
        }

        if deadline.is_some() {
            self.backend.wake();
        }
        Ok(id)
    }

    /// Ask the loop to cancel a transfer. False when it already finished.
    pub(crate) fn cancel(&self, id: TransferId) -> bool {
        if !self.is_pending(id) {
            return false;
        }
        self.send(LoopCommand::Cancel {
            id,
            reason: CancelReason::Requested,
        });
        true
    }

    /// Cancel every transfer of `handle` and wait up to `wait` for them to
    /// settle. Returns the number still pending.
    pub(crate) fn cancel_handle(&self, handle: HandleId, wait: Duration) -> usize {
        let ids: Vec<TransferId> = self
            .pending()
            .iter()
            .filter(|(_, p)| p.handle == handle)
            .map(|(id, _)| *id)
            .collect();

        if ids.is_empty() {
            return 0;
        }
        debug!("Cancelling {} pending transfers of {}", ids.len(), handle);

        for id in ids {
            self.send(LoopCommand::Cancel {
                id,
                reason: CancelReason::HandleClosed,
            });
        }

        // The loop cannot wait for itself; it settles them next iteration
        if self.is_loop_thread() {
            return self.count_for(&self.pending(), handle);
        }

        let deadline = Instant::now() + wait;
        let mut pending = self.pending();
        loop {
            let remaining = self.count_for(&pending, handle);
            let now = Instant::now();
            if remaining == 0 || now >= deadline {
                return remaining;
            }
            pending = match self.settled.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn count_for(&self, pending: &HashMap<TransferId, PendingTransfer>, handle: HandleId) -> usize {
        pending.values().filter(|p| p.handle == handle).count()
    }

    /// Stop accepting transfers and tell the loop to wind down
    pub(crate) fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.send(LoopCommand::Shutdown);
    }

    /// Main loop
    ///
    /// Each iteration processes commands, expires deadlines, waits for
    /// completions up to the nearest deadline and dispatches them.
    fn run(self: Arc<Self>) {
        let _ = self.loop_thread.set(thread::current().id());
        info!("USB event loop started");

        loop {
            let mut shutdown = false;
            while let Ok(command) = self.command_rx.try_recv() {
                match command {
                    LoopCommand::Cancel { id, reason } => self.begin_cancel(id, reason),
                    LoopCommand::Shutdown => shutdown = true,
                }
            }

            if shutdown {
                self.drain_for_shutdown();
                break;
            }

            let wait = self.expire_deadlines();
            for completion in self.backend.wait_completions(wait) {
                self.dispatch(completion);
            }
        }

        info!("USB event loop stopped");
    }

    fn begin_cancel(&self, id: TransferId, reason: CancelReason) {
        let submitted = match self.pending().get_mut(&id) {
            Some(p) if p.cancel.is_none() => {
                p.cancel = Some(reason);
                p.submitted
            }
            // Finished, or a cancel is already under way
            _ => return,
        };

        if submitted && !self.backend.cancel(id) {
            // Completion already on its way; its genuine status stands
            trace!("{} completed before it could be cancelled", id);
        }
    }

    /// Cancel overdue transfers; returns how long to wait for completions
    fn expire_deadlines(&self) -> Duration {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut nearest: Option<Instant> = None;

        for (id, p) in self.pending().iter() {
            if p.cancel.is_some() {
                continue;
            }
            match p.deadline {
                Some(deadline) if deadline <= now => expired.push(*id),
                Some(deadline) => nearest = Some(nearest.map_or(deadline, |n| n.min(deadline))),
                None => {}
            }
        }

        for id in expired {
            debug!("{} timed out", id);
            self.begin_cancel(id, CancelReason::TimedOut);
        }

        nearest
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(self.poll_interval)
            .min(self.poll_interval)
    }

    fn dispatch(&self, completion: BackendCompletion) {
        let Some(pending) = self.pending().remove(&completion.token) else {
            debug!("Dropping completion for unknown {}", completion.token);
            return;
        };
        self.settled.notify_all();

        let status = terminal_status(completion.status, pending.cancel, &pending.device);
        trace!("{} finished: {}", completion.token, status);

        let completed = CompletedTransfer {
            id: completion.token,
            endpoint: pending.endpoint,
            kind: pending.kind,
            status,
            actual_length: completion.actual_length,
            buffer: completion.buffer,
            iso_packets: completion
                .iso_packets
                .into_iter()
                .map(iso_packet_result)
                .collect(),
        };

        invoke(pending.callback, completed);
    }

    /// Cancel everything, give the backend a bounded time to return the
    /// transfers, then finish the rest as cancelled without their buffers
    fn drain_for_shutdown(&self) {
        let ids: Vec<TransferId> = self.pending().keys().copied().collect();
        if !ids.is_empty() {
            info!("Cancelling {} pending transfers for shutdown", ids.len());
        }
        for id in ids {
            self.begin_cancel(id, CancelReason::Shutdown);
        }

        let deadline = Instant::now() + self.shutdown_drain;
        while self.pending_count() > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.poll_interval);
            for completion in self.backend.wait_completions(wait) {
                self.dispatch(completion);
            }
        }

        let abandoned: Vec<(TransferId, PendingTransfer)> = self.pending().drain().collect();
        if !abandoned.is_empty() {
            warn!(
                "{} transfers did not settle before shutdown",
                abandoned.len()
            );
        }
        self.settled.notify_all();

        for (id, pending) in abandoned {
            invoke(
                pending.callback,
                CompletedTransfer {
                    id,
                    endpoint: pending.endpoint,
                    kind: pending.kind,
                    status: TransferStatus::Cancelled,
                    actual_length: 0,
                    buffer: Vec::new(),
                    iso_packets: Vec::new(),
                },
            );
        }
    }
}

/// Run a callback, keeping a panic from taking the loop down
fn invoke(callback: CompletionCallback, completed: CompletedTransfer) {
    let id = completed.id;
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        callback(completed)
    }));

    if let Err(e) = result {
        error!("Panic in completion callback of {}: {:?}", id, e);
    }
}

fn terminal_status(
    status: BackendStatus,
    cancel: Option<CancelReason>,
    device: &Device,
) -> TransferStatus {
    match status {
        BackendStatus::Completed => TransferStatus::Completed,
        BackendStatus::Cancelled => match cancel {
            Some(CancelReason::TimedOut) => TransferStatus::TimedOut,
            _ => TransferStatus::Cancelled,
        },
        BackendStatus::Failed(BackendError::Timeout) => TransferStatus::TimedOut,
        BackendStatus::Failed(error) => {
            let error = error.into_transfer_error();
            if error == UsbError::Disconnected {
                device.mark_gone();
            }
            TransferStatus::Errored(error)
        }
    }
}

fn iso_packet_result(packet: BackendIsoPacket) -> IsoPacketResult {
    let status = match packet.status {
        BackendStatus::Completed => TransferStatus::Completed,
        BackendStatus::Cancelled => TransferStatus::Cancelled,
        BackendStatus::Failed(error) => TransferStatus::Errored(error.into_transfer_error()),
    };
    IsoPacketResult {
        length: packet.length,
        actual_length: packet.actual_length,
        status,
    }
}
