//! Priority queue with aging.
//!
//! Plain data structure with no timers or channels of its own; the
//! scheduler drives it and supplies `now`.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::identifiers::CommandId;

use super::command::{Priority, QueuedCommand};

// ============================================================================
// CommandQueue
// ============================================================================

/// Commands ordered by priority (descending), then acceptance time.
#[derive(Debug, Default)]
pub struct CommandQueue {
    items: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued commands.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts before the first command of strictly lower priority.
    ///
    /// Equal priorities keep arrival order.
    pub fn insert(&mut self, command: QueuedCommand) {
        let position = self
            .items
            .iter()
            .position(|queued| queued.priority < command.priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, command);
    }

    /// Puts a command at the very front, ahead of every priority.
    pub fn push_front(&mut self, command: QueuedCommand) {
        self.items.push_front(command);
    }

    /// Removes up to `size` commands from the front.
    pub fn take_batch(&mut self, size: usize) -> Vec<QueuedCommand> {
        let count = size.min(self.items.len());
        self.items.drain(..count).collect()
    }

    /// Removes a command by id.
    pub fn remove(&mut self, id: CommandId) -> Option<QueuedCommand> {
        let position = self.items.iter().position(|queued| queued.id == id)?;
        self.items.remove(position)
    }

    /// Raises by one level every command that has waited longer than
    /// `threshold` since acceptance or its last boost.
    ///
    /// Re-sorts by (priority desc, acceptance asc) when anything changed.
    /// Returns the number of commands boosted.
    pub fn boost_aged(&mut self, now: Instant, threshold: Duration) -> usize {
        let mut boosted = 0;

        for queued in &mut self.items {
            if queued.priority < Priority::Critical && queued.aged(now) > threshold {
                queued.priority = queued.priority.boosted();
                queued.last_boosted_at = Some(now);
                boosted += 1;
            }
        }

        if boosted > 0 {
            self.items.make_contiguous().sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
            });
        }

        boosted
    }

    /// Queued count per priority, indexed by [`Priority::index`].
    #[must_use]
    pub fn distribution(&self) -> [usize; 4] {
        let mut counts = [0; 4];
        for queued in &self.items {
            counts[queued.priority.index()] += 1;
        }
        counts
    }

    /// Iterates in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.items.iter()
    }

    /// Removes everything.
    pub fn drain(&mut self) -> impl Iterator<Item = QueuedCommand> + '_ {
        self.items.drain(..)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::scheduler::command::CommandOptions;

    fn command(priority: Priority, enqueued_at: Instant) -> QueuedCommand {
        QueuedCommand::new(
            format!("echo {priority}"),
            CommandOptions::new().with_priority(priority),
            Duration::from_secs(1),
            3,
            enqueued_at,
        )
        .0
    }

    fn priorities(queue: &CommandQueue) -> Vec<Priority> {
        queue.iter().map(|c| c.priority).collect()
    }

    #[test]
    fn test_dispatch_follows_priority() {
        let now = Instant::now();
        let mut queue = CommandQueue::new();
        queue.insert(command(Priority::Low, now));
        queue.insert(command(Priority::Critical, now));
        queue.insert(command(Priority::Normal, now));

        let batch: Vec<_> = queue.take_batch(3).into_iter().map(|c| c.priority).collect();
        assert_eq!(batch, vec![Priority::Critical, Priority::Normal, Priority::Low]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_equal_priority_keeps_arrival_order() {
        let now = Instant::now();
        let mut queue = CommandQueue::new();
        let first = command(Priority::High, now);
        let second = command(Priority::High, now);
        let (first_id, second_id) = (first.id, second.id);
        queue.insert(first);
        queue.insert(command(Priority::Low, now));
        queue.insert(second);

        let ids: Vec<_> = queue.iter().map(|c| c.id).collect();
        assert_eq!(ids[0], first_id);
        assert_eq!(ids[1], second_id);
    }

    #[test]
    fn test_take_batch_bounds() {
        let now = Instant::now();
        let mut queue = CommandQueue::new();
        for _ in 0..3 {
            queue.insert(command(Priority::Normal, now));
        }
        assert_eq!(queue.take_batch(2).len(), 2);
        assert_eq!(queue.take_batch(5).len(), 1);
        assert!(queue.take_batch(5).is_empty());
    }

    #[test]
    fn test_push_front_beats_priority() {
        let now = Instant::now();
        let mut queue = CommandQueue::new();
        queue.insert(command(Priority::Critical, now));
        let retried = command(Priority::Low, now);
        let retried_id = retried.id;
        queue.push_front(retried);

        assert_eq!(queue.iter().next().map(|c| c.id), Some(retried_id));
    }

    #[test]
    fn test_remove_by_id() {
        let now = Instant::now();
        let mut queue = CommandQueue::new();
        let target = command(Priority::Normal, now);
        let id = target.id;
        queue.insert(target);
        queue.insert(command(Priority::Normal, now));

        assert_eq!(queue.remove(id).map(|c| c.id), Some(id));
        assert!(queue.remove(id).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_aging_raises_one_level_per_cycle() {
        let start = Instant::now();
        let threshold = Duration::from_secs(10);
        let mut queue = CommandQueue::new();
        queue.insert(command(Priority::Low, start));

        // Not old enough
        assert_eq!(queue.boost_aged(start + Duration::from_secs(5), threshold), 0);
        assert_eq!(priorities(&queue), vec![Priority::Low]);

        let t1 = start + Duration::from_secs(11);
        assert_eq!(queue.boost_aged(t1, threshold), 1);
        assert_eq!(priorities(&queue), vec![Priority::Normal]);

        // Same cycle again: measured from the last boost
        assert_eq!(queue.boost_aged(t1, threshold), 0);
        assert_eq!(priorities(&queue), vec![Priority::Normal]);

        let t2 = t1 + Duration::from_secs(11);
        queue.boost_aged(t2, threshold);
        let t3 = t2 + Duration::from_secs(11);
        queue.boost_aged(t3, threshold);
        assert_eq!(priorities(&queue), vec![Priority::Critical]);

        // Capped
        assert_eq!(queue.boost_aged(t3 + Duration::from_secs(60), threshold), 0);
        assert_eq!(priorities(&queue), vec![Priority::Critical]);
    }

    #[test]
    fn test_aging_resorts_queue() {
        let start = Instant::now();
        let threshold = Duration::from_secs(10);
        let mut queue = CommandQueue::new();

        let old_low = command(Priority::Low, start);
        let old_low_id = old_low.id;
        queue.insert(old_low);

        let fresh = start + Duration::from_secs(9);
        queue.insert(command(Priority::Normal, fresh));

        // old_low becomes Normal and, being older, moves ahead
        queue.boost_aged(start + Duration::from_secs(11), threshold);
        assert_eq!(queue.iter().next().map(|c| c.id), Some(old_low_id));
        assert_eq!(priorities(&queue), vec![Priority::Normal, Priority::Normal]);
    }

    #[test]
    fn test_distribution() {
        let now = Instant::now();
        let mut queue = CommandQueue::new();
        queue.insert(command(Priority::Low, now));
        queue.insert(command(Priority::Low, now));
        queue.insert(command(Priority::Critical, now));
        assert_eq!(queue.distribution(), [2, 0, 0, 1]);
    }
}
