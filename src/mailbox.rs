use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: Option<T>,
    dropped: u64,
    closed: bool,
}

/// Single-slot handoff between a frame producer and the render loop.
///
/// `post` overwrites whatever is waiting and never blocks; `take` drains the slot.
/// At most one frame is ever buffered, so a slow consumer sees only the newest frame.
pub struct FrameMailbox<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> FrameMailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                dropped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value`, replacing an unconsumed frame. Returns true if one was replaced.
    pub fn post(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.closed {
            return false;
        }
        let replaced = slot.value.replace(value).is_some();
        if replaced {
            slot.dropped += 1;
        }
        drop(slot);
        self.ready.notify_one();
        replaced
    }

    pub fn take(&self) -> Option<T> {
        self.lock().value.take()
    }

    /// Waits up to `timeout` for a frame. Returns `None` on timeout or once closed and empty.
    pub fn wait_take(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            if slot.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    /// Frames overwritten before the consumer reached them.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Rejects further posts and wakes waiters. A pending frame can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<T> Default for FrameMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn newest_frame_wins() {
        let mailbox = FrameMailbox::new();
        assert!(!mailbox.post(1));
        assert!(mailbox.post(2));
        assert!(mailbox.post(3));
        assert_eq!(mailbox.take(), Some(3));
        assert_eq!(mailbox.take(), None);
        assert_eq!(mailbox.dropped(), 2);
    }

    #[test]
    fn wait_take_times_out_when_empty() {
        let mailbox: FrameMailbox<u32> = FrameMailbox::new();
        assert_eq!(mailbox.wait_take(Duration::from_millis(5)), None);
    }

    #[test]
    fn waiting_consumer_wakes_on_post() {
        let mailbox = Arc::new(FrameMailbox::new());
        let consumer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.wait_take(Duration::from_secs(5)))
        };
        mailbox.post(42u32);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn closed_mailbox_rejects_posts_but_drains() {
        let mailbox = FrameMailbox::new();
        mailbox.post(1);
        mailbox.close();
        assert!(!mailbox.post(2));
        assert_eq!(mailbox.wait_take(Duration::from_secs(1)), Some(1));
        assert_eq!(mailbox.wait_take(Duration::from_secs(1)), None);
        assert!(mailbox.is_closed());
    }
}
