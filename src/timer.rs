//! Call deadline enforcement.
//!
//! A single background thread keeps a min-heap of call deadlines and cancels
//! each call with `DEADLINE_EXCEEDED` when its deadline passes. The heap only
//! holds weak references. Entries of calls that were dropped before their
//! deadline are swept out whenever the heap doubles past its last sweep.

use crate::StatusCode;
use crate::status::Status;
use crate::stream::Stream;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tracing::trace;

struct Entry {
    at: Instant,
    seq: u64,
    stream: Weak<Stream>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // earliest deadline first, then earliest scheduled
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

const MIN_SWEEP: usize = 64;

struct TimerState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    sweep_at: usize,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            sweep_at: MIN_SWEEP,
        }
    }
}

impl TimerState {
    /// Queue a deadline. Returns whether it is now the earliest one.
    fn push(&mut self, at: Instant, stream: Weak<Stream>) -> bool {
        if self.heap.len() >= self.sweep_at {
            let before = self.heap.len();
            self.heap.retain(|e| e.stream.strong_count() > 0);
            self.sweep_at = (self.heap.len() * 2).max(MIN_SWEEP);
            trace!(before, after = self.heap.len(), "swept dropped calls");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let earliest = self.heap.peek().is_none_or(|e| at < e.at);
        self.heap.push(Entry { at, seq, stream });
        earliest
    }
}

struct Timer {
    state: Mutex<TimerState>,
    wake: Condvar,
}

static TIMER: OnceLock<Arc<Timer>> = OnceLock::new();

fn timer() -> &'static Arc<Timer> {
    TIMER.get_or_init(|| {
        let timer = Arc::new(Timer {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
        });
        let worker = timer.clone();
        std::thread::Builder::new()
            .name("rpc-deadline".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn deadline thread");
        timer
    })
}

/// Arrange for `stream` to be cancelled when its deadline passes.
pub(crate) fn schedule(stream: &Arc<Stream>) {
    let Some(at) = stream.deadline().to_instant() else {
        return;
    };
    let timer = timer();
    let earliest = timer.state.lock().push(at, Arc::downgrade(stream));
    if earliest {
        timer.wake.notify_one();
    }
}

impl Timer {
    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            let mut expired = Vec::new();
            while state.heap.peek().is_some_and(|e| e.at <= now) {
                if let Some(entry) = state.heap.pop() {
                    expired.push(entry.stream);
                }
            }

            if !expired.is_empty() {
                drop(state);
                for stream in expired.iter().filter_map(Weak::upgrade) {
                    trace!(stream = stream.id(), "deadline expired");
                    stream.cancel(Status::local(
                        StatusCode::DeadlineExceeded,
                        "Deadline Exceeded",
                    ));
                }
                state = self.state.lock();
                continue;
            }

            match state.heap.peek().map(|e| e.at) {
                Some(at) => {
                    self.wake.wait_until(&mut state, at);
                }
                None => self.wake.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_entry_order() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        for (i, offset) in [30u64, 10, 20, 10].into_iter().enumerate() {
            heap.push(Entry {
                at: base + Duration::from_millis(offset),
                seq: i as u64,
                stream: Weak::new(),
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|e| e.seq).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_dropped_calls_swept() {
        let far = Instant::now() + Duration::from_secs(3600);
        let live = Stream::new(
            "m".to_string(),
            "h".to_string(),
            crate::Timespec::inf_future(),
            "localhost:1".parse().unwrap(),
            None,
        );

        let mut state = TimerState::default();
        assert!(state.push(far, Arc::downgrade(&live)));
        for _ in 0..1000 {
            state.push(far, Weak::new());
        }
        // only the live entry and the dead ones since the last sweep remain
        assert!(state.heap.len() < 2 * MIN_SWEEP);
        assert_eq!(
            state
                .heap
                .iter()
                .filter(|e| e.stream.strong_count() > 0)
                .count(),
            1
        );
        assert!(!state.push(far + Duration::from_secs(1), Weak::new()));
    }
}
