//! Bounded in-memory record of recent monitoring ticks

use pulse_core::Tick;
use std::collections::VecDeque;
use tokio::sync::Mutex;

pub struct TickLog {
    ticks: Mutex<VecDeque<Tick>>,
    capacity: usize,
}

impl TickLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ticks: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append, dropping the oldest tick once full
    pub async fn push(&self, tick: Tick) {
        let mut ticks = self.ticks.lock().await;
        if ticks.len() >= self.capacity {
            ticks.pop_front();
        }
        ticks.push_back(tick);
    }

    /// Oldest first
    pub async fn recent(&self) -> Vec<Tick> {
        self.ticks.lock().await.iter().cloned().collect()
    }
}
