use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::ports::GeofenceEventKind;

/// Sliding-window enter/exit counter. When both kinds pile up within the
/// window the hysteresis factor is likely tuned too tight for the terrain;
/// the flag is diagnostic only and never changes state.
pub struct PingPongDetector {
    window_secs: u64,
    threshold: usize,
    events: VecDeque<(DateTime<Utc>, GeofenceEventKind)>,
}

impl PingPongDetector {
    pub fn new(window_secs: u64, threshold: usize) -> Self {
        Self {
            window_secs,
            threshold,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, kind: GeofenceEventKind, now: DateTime<Utc>) {
        self.events.push_back((now, kind));
        self.evict(now);
    }

    pub fn is_ping_ponging(&mut self, now: DateTime<Utc>) -> bool {
        self.evict(now);
        let enters = self
            .events
            .iter()
            .filter(|(_, kind)| *kind == GeofenceEventKind::Enter)
            .count();
        let exits = self.events.len() - enters;
        enters >= self.threshold && exits >= self.threshold
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(self.window_secs as i64);
        while let Some((at, _)) = self.events.front() {
            if *at < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}
