use std::collections::VecDeque;

use super::WindowFullPolicy;

/// Admission control for outbound publishes.
///
/// `admitted` is always the number of QoS 1/2 publishes currently accepted
/// and not yet acknowledged, as counted by the caller.
#[derive(Debug)]
pub struct FlowController<T> {
    max_inflight: usize,
    policy: WindowFullPolicy,
    waiting: VecDeque<T>,
}

impl<T> FlowController<T> {
    pub fn new(max_inflight: usize, policy: WindowFullPolicy) -> Self {
        Self {
            max_inflight: max_inflight.max(1),
            policy,
            waiting: VecDeque::new(),
        }
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    pub fn policy(&self) -> WindowFullPolicy {
        self.policy
    }

    /// Returns the item when it may be admitted now. Otherwise it is parked
    /// behind earlier waiters and handed back by `release`.
    pub fn admit(&mut self, admitted: usize, item: T) -> Option<T> {
        match self.policy {
            WindowFullPolicy::Queue => Some(item),
            WindowFullPolicy::Block if self.waiting.is_empty() && admitted < self.max_inflight => {
                Some(item)
            }
            WindowFullPolicy::Block => {
                self.waiting.push_back(item);
                None
            }
        }
    }

    /// Waiters that fit in the window now, oldest first.
    pub fn release(&mut self, admitted: usize) -> Vec<T> {
        let room = self.max_inflight.saturating_sub(admitted);
        let count = room.min(self.waiting.len());
        self.waiting.drain(..count).collect()
    }

    /// Removes every waiter, used on shutdown.
    pub fn drain(&mut self) -> Vec<T> {
        self.waiting.drain(..).collect()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}
