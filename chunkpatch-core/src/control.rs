use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct ControlState {
    paused: bool,
    aborted: bool,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

/// Cooperative pause/abort handle shared between the caller and a worker.
#[derive(Clone, Default)]
pub struct Controller {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_paused(&self, paused: bool) {
        let mut st = self.state();
        if st.paused == paused {
            return;
        }
        st.paused = paused;
        if paused {
            st.paused_since = Some(Instant::now());
        } else if let Some(t0) = st.paused_since.take() {
            st.paused_total += t0.elapsed();
        }
        drop(st);
        self.inner.1.notify_all();
    }

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    /// Flips the pause state and returns the new value. An aborted controller stays unpaused.
    pub fn toggle_pause(&self) -> bool {
        let next = {
            let st = self.state();
            !st.paused && !st.aborted
        };
        self.set_paused(next);
        next
    }

    pub fn abort(&self) {
        let mut st = self.state();
        st.aborted = true;
        drop(st);
        self.inner.1.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    /// Time spent paused so far, including a pause still in progress.
    pub fn paused_for(&self) -> Duration {
        let st = self.state();
        st.paused_total + st.paused_since.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Blocks while paused. Returns false if the controller was aborted.
    pub fn wait_while_paused(&self) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut st = lock.lock().unwrap_or_else(|p| p.into_inner());
        while st.paused && !st.aborted {
            st = cvar.wait(st).unwrap_or_else(|p| p.into_inner());
        }
        !st.aborted
    }
}
