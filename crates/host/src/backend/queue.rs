//! Completion queue shared by the backends
//!
//! Completions pushed here are handed to the event loop in push order.
//! Entries can also be scheduled for a later instant; they become visible
//! once due, still in order of their due time.

use super::BackendCompletion;
use crate::transfer::TransferId;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<BackendCompletion>,
    /// Sorted by due time, insertion order kept among equal instants
    scheduled: VecDeque<(Instant, BackendCompletion)>,
    woken: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while self.scheduled.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, completion)) = self.scheduled.pop_front() {
                self.ready.push_back(completion);
            }
        }
    }
}

#[derive(Default)]
pub struct CompletionQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking producer leaves the queue itself consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, completion: BackendCompletion) {
        self.lock().ready.push_back(completion);
        self.signal.notify_all();
    }

    /// Deliver `completion` once `due` has passed
    pub fn push_at(&self, due: Instant, completion: BackendCompletion) {
        let mut state = self.lock();
        let position = state
            .scheduled
            .iter()
            .position(|(at, _)| *at > due)
            .unwrap_or(state.scheduled.len());
        state.scheduled.insert(position, (due, completion));
        drop(state);
        self.signal.notify_all();
    }

    /// Remove a scheduled completion that has not become due yet
    pub fn take_scheduled(&self, token: TransferId) -> Option<BackendCompletion> {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        let position = state.scheduled.iter().position(|(_, c)| c.token == token)?;
        state.scheduled.remove(position).map(|(_, c)| c)
    }

    /// Remove every scheduled completion matching `predicate`
    pub fn take_scheduled_where<F>(&self, mut predicate: F) -> Vec<BackendCompletion>
    where
        F: FnMut(&BackendCompletion) -> bool,
    {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|(_, c)| predicate(c));
        state.scheduled = kept;
        taken.into_iter().map(|(_, c)| c).collect()
    }

    /// Latest due time among scheduled completions matching `predicate`
    pub fn last_due_where<F>(&self, mut predicate: F) -> Option<Instant>
    where
        F: FnMut(&BackendCompletion) -> bool,
    {
        self.lock()
            .scheduled
            .iter()
            .filter(|(_, c)| predicate(c))
            .map(|(due, _)| *due)
            .max()
    }

    pub fn wake(&self) {
        self.lock().woken = true;
        self.signal.notify_all();
    }

    /// Wait up to `timeout` for completions and drain everything available
    pub fn wait(&self, timeout: Duration) -> Vec<BackendCompletion> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            let now = Instant::now();
            state.promote_due(now);
            if !state.ready.is_empty() || state.woken || now >= deadline {
                break;
            }

            let until = state
                .scheduled
                .front()
                .map(|(due, _)| (*due).min(deadline))
                .unwrap_or(deadline);
            state = match self.signal.wait_timeout(state, until - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }

        state.woken = false;
        state.ready.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use std::sync::Arc;

    fn completion(token: u64) -> BackendCompletion {
        BackendCompletion::new(TransferId(token), BackendStatus::Completed, 0, Vec::new())
    }

    #[test]
    fn test_wait_times_out_empty() {
        let queue = CompletionQueue::new();
        let start = Instant::now();
        assert!(queue.wait(Duration::from_millis(20)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_push_order_kept() {
        let queue = CompletionQueue::new();
        queue.push(completion(1));
        queue.push(completion(2));
        let tokens: Vec<_> = queue
            .wait(Duration::ZERO)
            .into_iter()
            .map(|c| c.token.0)
            .collect();
        assert_eq!(tokens, vec![1, 2]);
    }

    #[test]
    fn test_scheduled_becomes_ready() {
        let queue = CompletionQueue::new();
        queue.push_at(Instant::now() + Duration::from_millis(30), completion(7));

        assert!(queue.wait(Duration::from_millis(1)).is_empty());
        let ready = queue.wait(Duration::from_secs(2));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, TransferId(7));
    }

    #[test]
    fn test_take_scheduled() {
        let queue = CompletionQueue::new();
        queue.push_at(Instant::now() + Duration::from_secs(10), completion(3));
        assert!(queue.take_scheduled(TransferId(3)).is_some());
        assert!(queue.take_scheduled(TransferId(3)).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let queue = Arc::new(CompletionQueue::new());
        let waker = queue.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let start = Instant::now();
        assert!(queue.wait(Duration::from_secs(5)).is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
        thread.join().unwrap();
    }
}
