//! Windowed throughput estimation for progress reporting and the
//! lowest-speed abort.

use std::sync::Mutex;
use std::time::Instant;

const WINDOW_SECS: usize = 10;

struct SpeedState {
    slots: [u64; WINDOW_SECS],
    index: usize,
    last: Instant,
    started: Instant,
    total: u64,
    max: u64,
}

/// Sliding-window byte counter: one slot per second over the last ten
/// seconds, averaged over the window (or over the elapsed time while the
/// window is still filling).
pub struct SpeedCalc {
    state: Mutex<SpeedState>,
}

impl Default for SpeedCalc {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedCalc {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(SpeedState {
                slots: [0; WINDOW_SECS],
                index: 0,
                last: now,
                started: now,
                total: 0,
                max: 0,
            }),
        }
    }

    pub fn update(&self, bytes: u64) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        state.total += bytes;

        let elapsed = now.duration_since(state.last).as_secs() as usize;
        if elapsed > 0 {
            for _ in 0..elapsed.min(WINDOW_SECS) {
                state.index = (state.index + 1) % WINDOW_SECS;
                let i = state.index;
                state.slots[i] = 0;
            }
            state.last = now;
        }
        let i = state.index;
        state.slots[i] += bytes;

        let current = Self::window_speed(&state);
        if current > state.max {
            state.max = current;
        }
    }

    fn window_speed(state: &SpeedState) -> u64 {
        let elapsed = state.started.elapsed().as_secs_f64();
        let window = elapsed.clamp(1.0, WINDOW_SECS as f64);
        let total: u64 = state.slots.iter().sum();
        (total as f64 / window) as u64
    }

    /// Current speed in bytes per second.
    pub fn speed(&self) -> u64 {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::window_speed(&state)
    }

    pub fn total(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .total
    }

    /// Average speed since construction.
    pub fn average(&self) -> u64 {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = state.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (state.total as f64 / elapsed) as u64
    }
}
