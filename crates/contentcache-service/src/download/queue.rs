use std::collections::VecDeque;

use crate::config::AdmissionOrder;
use crate::types::Priority;

/// Fetches waiting for a free worker.
///
/// Every [`Priority`] has its own lane, and higher lanes are always drained first. Within a lane,
/// the [`AdmissionOrder`] decides whether the oldest or the newest entry starts next.
#[derive(Debug)]
pub(crate) struct AdmissionQueue<T> {
    order: AdmissionOrder,
    lanes: [VecDeque<T>; 3],
}

impl<T> AdmissionQueue<T> {
    pub fn new(order: AdmissionOrder) -> Self {
        Self {
            order,
            lanes: Default::default(),
        }
    }

    pub fn push(&mut self, priority: Priority, item: T) {
        self.lanes[priority.index()].push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        for priority in Priority::ALL_DESCENDING {
            let lane = &mut self.lanes[priority.index()];
            let item = match self.order {
                AdmissionOrder::Fifo => lane.pop_front(),
                AdmissionOrder::Lifo => lane.pop_back(),
            };
            if item.is_some() {
                return item;
            }
        }
        None
    }

    /// Removes the first queued item matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        for lane in &mut self.lanes {
            if let Some(idx) = lane.iter().position(&mut predicate) {
                return lane.remove(idx);
            }
        }
        None
    }

    /// Removes all queued items.
    pub fn drain(&mut self) -> Vec<T> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}
