use std::collections::VecDeque;

use crate::model::ProviderId;

/// Round-robin fairness buffer for structured items.
///
/// Arrival order across providers is naturally unfair: one fast provider can
/// flush many items before a slow one emits its first. This buffer holds one
/// FIFO lane per provider and releases items one-per-provider in the fixed
/// declaration order, so a slow provider's items are never starved once
/// available.
///
/// The walk keeps its position between drains. When it reaches a provider
/// that has produced nothing and is not terminal, it parks there: that
/// provider is merely slow, and skipping it would be the unfairness this
/// buffer exists to prevent. Everything queued behind the parked position is
/// held until the provider produces or terminates. A terminal provider never
/// blocks the walk; once terminal and empty it leaves the rotation entirely.
pub(crate) struct ItemInterleaver {
    lanes: Vec<Lane>,
    cursor: usize,
}

struct Lane {
    provider: ProviderId,
    queue: VecDeque<serde_json::Value>,
    produced: bool,
    terminal: bool,
}

impl ItemInterleaver {
    /// Creates a buffer with one lane per provider, in canonical order.
    pub fn new(order: &[ProviderId]) -> Self {
        Self {
            lanes: order
                .iter()
                .map(|provider| Lane {
                    provider: provider.clone(),
                    queue: VecDeque::new(),
                    produced: false,
                    terminal: false,
                })
                .collect(),
            cursor: 0,
        }
    }

    /// Appends an item to its provider's lane and returns whatever the walk
    /// can release, in emission order.
    ///
    /// Items for an undeclared provider pass straight through; only declared
    /// targets participate in the rotation.
    pub fn push(
        &mut self,
        provider: &ProviderId,
        payload: serde_json::Value,
    ) -> Vec<(ProviderId, serde_json::Value)> {
        let Some(lane) = self.lane_mut(provider) else {
            return vec![(provider.clone(), payload)];
        };
        lane.produced = true;
        lane.queue.push_back(payload);
        self.drain()
    }

    /// Marks a provider terminal and returns items the walk can now release.
    ///
    /// A provider that terminates with zero items simply leaves the
    /// rotation; no placeholder is synthesized here.
    pub fn seal(&mut self, provider: &ProviderId) -> Vec<(ProviderId, serde_json::Value)> {
        if let Some(lane) = self.lane_mut(provider) {
            lane.terminal = true;
        }
        self.drain()
    }

    /// True when no lane holds an undelivered item.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.queue.is_empty())
    }

    /// True when the given provider's lane holds no undelivered item.
    ///
    /// Undeclared providers hold nothing by definition.
    pub fn lane_is_empty(&self, provider: &ProviderId) -> bool {
        self.lanes
            .iter()
            .find(|l| &l.provider == provider)
            .is_none_or(|lane| lane.queue.is_empty())
    }

    fn lane_mut(&mut self, provider: &ProviderId) -> Option<&mut Lane> {
        self.lanes.iter_mut().find(|l| &l.provider == provider)
    }

    fn drain(&mut self) -> Vec<(ProviderId, serde_json::Value)> {
        let mut released = Vec::new();
        if self.lanes.is_empty() {
            return released;
        }
        let mut idle_visits = 0;
        while idle_visits < self.lanes.len() {
            let lane = &mut self.lanes[self.cursor];
            if let Some(payload) = lane.queue.pop_front() {
                released.push((lane.provider.clone(), payload));
                idle_visits = 0;
            } else if !lane.produced && !lane.terminal {
                // Parked on a silent, still-live provider.
                return released;
            } else {
                idle_visits += 1;
            }
            self.cursor = (self.cursor + 1) % self.lanes.len();
        }
        released
    }
}
