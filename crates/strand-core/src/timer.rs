use std::{
    collections::{BTreeMap, HashMap},
    io,
    os::fd::RawFd,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{error, warn};

/// Handle for cancelling a registered timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) type TimerCallback = Arc<Mutex<dyn FnMut() + Send>>;

pub(crate) struct TimerEntry {
    pub(crate) id: u64,
    pub(crate) expiration: Instant,
    /// `None` for one-shot timers.
    pub(crate) interval: Option<Duration>,
    pub(crate) callback: TimerCallback,
}

/// The shortest delay the kernel timer is armed with; re-arming with
/// zero would spin the loop.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

fn create_timerfd() -> RawFd {
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
    assert!(fd >= 0, "timerfd_create failed: {}", io::Error::last_os_error());
    fd
}

fn arm_timerfd(fd: RawFd, delay: Duration) {
    let delay = delay.max(MIN_ARM_DELAY);
    let spec = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(delay.subsec_nanos()),
        },
    };
    if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } != 0 {
        error!(err = %io::Error::last_os_error(), "timerfd_settime failed");
    }
}

fn disarm_timerfd(fd: RawFd) {
    let spec = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
    };
    if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } != 0 {
        error!(err = %io::Error::last_os_error(), "timerfd_settime failed");
    }
}

/// Ordered, cancellable timer set behind one kernel timerfd.
///
/// Two indices: by `(expiration, id)` for firing (ties fire in id
/// order) and by id for cancellation. Only touched on the owning loop's
/// thread.
pub(crate) struct TimerQueue {
    fd: RawFd,
    by_expiration: BTreeMap<(Instant, u64), TimerEntry>,
    by_id: HashMap<u64, Instant>,
    armed_for: Option<Instant>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            fd: create_timerfd(),
            by_expiration: BTreeMap::new(),
            by_id: HashMap::new(),
            armed_for: None,
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn drain_fd(&self) {
        let mut expirations = 0u64;
        let n = unsafe {
            libc::read(self.fd, (&raw mut expirations).cast::<libc::c_void>(), 8)
        };
        if n != 8 {
            warn!(n, "short read from timerfd");
        }
    }

    pub(crate) fn add(&mut self, entry: TimerEntry) {
        let earlier = self.armed_for.is_none_or(|armed| entry.expiration < armed);
        self.by_id.insert(entry.id, entry.expiration);
        self.by_expiration.insert((entry.expiration, entry.id), entry);
        if earlier {
            self.rearm();
        }
    }

    /// Cancelling a timer whose callback is currently running is a no-op
    /// for that firing; a repeating timer's re-inserted future entry is
    /// removed here.
    pub(crate) fn cancel(&mut self, id: u64) {
        if let Some(expiration) = self.by_id.remove(&id) {
            self.by_expiration.remove(&(expiration, id));
        }
    }

    /// Extracts every entry due at `now`, re-inserting repeating entries
    /// at `now + interval` first so their callbacks may cancel them.
    /// The caller runs the returned callbacks without touching the queue.
    pub(crate) fn extract_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(entry) = self.by_expiration.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let entry = entry.remove();
            self.by_id.remove(&entry.id);
            due.push(entry);
        }

        for entry in &due {
            if let Some(interval) = entry.interval {
                self.add(TimerEntry {
                    id: entry.id,
                    expiration: now + interval,
                    interval: Some(interval),
                    callback: Arc::clone(&entry.callback),
                });
            }
        }
        due
    }

    /// Re-arms the kernel timer to the next earliest expiration, or
    /// disarms it when the queue is empty.
    pub(crate) fn rearm(&mut self) {
        match self.by_expiration.keys().next() {
            Some(&(expiration, _)) => {
                arm_timerfd(self.fd, expiration.saturating_duration_since(Instant::now()));
                self.armed_for = Some(expiration);
            }
            None => {
                if self.armed_for.take().is_some() {
                    disarm_timerfd(self.fd);
                }
            }
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, expiration: Instant, interval: Option<Duration>) -> TimerEntry {
        TimerEntry { id, expiration, interval, callback: Arc::new(Mutex::new(|| {})) }
    }

    #[test]
    fn fires_in_expiration_then_id_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.add(entry(3, now, None));
        queue.add(entry(1, now, None));
        queue.add(entry(2, now - Duration::from_millis(5), None));

        let due = queue.extract_due(now);
        let ids: Vec<u64> = due.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert!(queue.by_expiration.is_empty());
    }

    #[test]
    fn repeating_entry_reinserted_before_callbacks_run() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let interval = Duration::from_millis(50);
        queue.add(entry(1, now, Some(interval)));

        let due = queue.extract_due(now);
        assert_eq!(due.len(), 1);
        // Already re-inserted, so an in-callback cancel has something to hit.
        assert_eq!(queue.by_id.get(&1), Some(&(now + interval)));

        queue.cancel(1);
        assert!(queue.by_expiration.is_empty());
    }

    #[test]
    fn cancel_of_extracted_oneshot_is_noop() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.add(entry(7, now, None));
        let due = queue.extract_due(now);
        assert_eq!(due.len(), 1);
        queue.cancel(7);
        assert!(queue.by_id.is_empty());
    }

    #[test]
    fn future_entries_stay_queued() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.add(entry(1, now + Duration::from_secs(10), None));
        assert!(queue.extract_due(now).is_empty());
        assert_eq!(queue.by_id.len(), 1);
    }
}
