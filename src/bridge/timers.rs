// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Delayed tasks owned by the bridge task.

use std::collections::BTreeMap;

use tokio::time::Instant;

/// Tasks due at a deadline, fired in deadline then insertion order.
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(Instant, u64), T>,
    seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, task: T) {
        self.entries.insert((deadline, self.seq), task);
        self.seq += 1;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every task whose deadline is not after `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(start + Duration::from_millis(20), "late");
        timers.schedule(start + Duration::from_millis(10), "early");
        timers.schedule(start + Duration::from_millis(10), "early-second");

        assert_eq!(timers.next_deadline(), Some(start + Duration::from_millis(10)));
        assert!(timers.pop_due(start).is_empty());
        assert_eq!(
            timers.pop_due(start + Duration::from_millis(10)),
            vec!["early", "early-second"]
        );
        assert_eq!(timers.pop_due(start + Duration::from_secs(1)), vec!["late"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_clear_cancels() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(start, 1);
        timers.schedule(start, 2);
        assert_eq!(timers.len(), 2);

        timers.clear();
        assert!(timers.pop_due(start + Duration::from_secs(5)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
