/// Staff review queue.
///
/// Pending appointment requests are reviewed urgent first, then by
/// descending priority, then oldest first. Requests order themselves that
/// way (see `AppointmentRequest`'s `Ord`), so the queue is a max-heap.

use std::collections::BinaryHeap;

use crate::error::{FulfillmentError, Result};
use crate::models::AppointmentRequest;

/// A request the review pass could not act on.
#[derive(Debug, Clone)]
pub struct ReviewFailure {
    pub request: AppointmentRequest,
    pub error: FulfillmentError,
}

/// Outcome of reviewing a whole queue.
#[derive(Debug, Default)]
pub struct ReviewBatch {
    pub processed: Vec<AppointmentRequest>,
    pub failed: Vec<ReviewFailure>,
    pub total: usize,
}

impl ReviewBatch {
    /// Calculate the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.processed.len() as f64 / self.total as f64) * 100.0
    }
}

#[derive(Debug, Default)]
pub struct ReviewQueue {
    queue: BinaryHeap<AppointmentRequest>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: AppointmentRequest) {
        self.queue.push(request);
    }

    /// The request that should be reviewed next.
    pub fn peek(&self) -> Option<&AppointmentRequest> {
        self.queue.peek()
    }

    pub fn pop(&mut self) -> Option<AppointmentRequest> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every queued request, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    /// Consume the queue into review order.
    pub fn into_ordered(self) -> Vec<AppointmentRequest> {
        let mut ordered = self.queue.into_sorted_vec();
        ordered.reverse();
        ordered
    }

    /// Pop every request in review order and hand it to `review`.
    pub fn process(
        &mut self,
        mut review: impl FnMut(&AppointmentRequest) -> Result<AppointmentRequest>,
    ) -> ReviewBatch {
        let mut batch = ReviewBatch {
            total: self.queue.len(),
            ..ReviewBatch::default()
        };
        while let Some(request) = self.queue.pop() {
            match review(&request) {
                Ok(updated) => batch.processed.push(updated),
                Err(error) => batch.failed.push(ReviewFailure { request, error }),
            }
        }
        batch
    }
}

impl Extend<AppointmentRequest> for ReviewQueue {
    fn extend<I: IntoIterator<Item = AppointmentRequest>>(&mut self, iter: I) {
        self.queue.extend(iter);
    }
}

impl FromIterator<AppointmentRequest> for ReviewQueue {
    fn from_iter<I: IntoIterator<Item = AppointmentRequest>>(iter: I) -> Self {
        ReviewQueue {
            queue: iter.into_iter().collect(),
        }
    }
}
