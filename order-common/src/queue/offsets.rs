use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Turns out-of-order acks from concurrent workers into safe Kafka offset
/// stores.
///
/// Kafka only remembers a single committed offset per partition, which
/// implicitly acks everything below it. An offset is therefore handed out
/// for storing only once every lower tracked offset on its partition has
/// been acked. A nack rewinds the partition: the consumer seeks back to the
/// nacked offset and everything tracked from there on is forgotten, because
/// it will be delivered again.
#[derive(Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<i32, PartitionOffsets>>,
}

#[derive(Default)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    acked: BTreeSet<i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message handed to a worker.
    pub fn track(&self, partition: i32, offset: i64) {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions
                .entry(partition)
                .or_default()
                .pending
                .insert(offset);
        }
    }

    /// Mark an offset as done. Returns the highest offset that is now safe to
    /// store for the partition, if the watermark moved.
    pub fn ack(&self, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock().ok()?;
        let offsets = partitions.get_mut(&partition)?;
        if !offsets.pending.remove(&offset) {
            // unknown offset: partition was revoked since the pull
            return None;
        }
        offsets.acked.insert(offset);

        let committable = match offsets.pending.first() {
            Some(&lowest_pending) => offsets.acked.range(..lowest_pending).next_back().copied(),
            None => offsets.acked.last().copied(),
        }?;

        offsets.acked = offsets.acked.split_off(&(committable + 1));
        Some(committable)
    }

    /// Forget `offset` and everything above it on `partition` while `seek`
    /// moves the consumer back to `offset`. The lock is held across `seek`, so
    /// no redelivered offset is tracked before the rewind. A failed seek
    /// leaves the partition untouched and the offset pending.
    pub fn rewind<E>(
        &self,
        partition: i32,
        offset: i64,
        seek: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut partitions = match self.partitions.lock() {
            Ok(partitions) => partitions,
            Err(poisoned) => poisoned.into_inner(),
        };
        seek()?;

        if let Some(offsets) = partitions.get_mut(&partition) {
            offsets.pending.retain(|&tracked| tracked < offset);
            offsets.acked.retain(|&tracked| tracked < offset);
        }
        Ok(())
    }

    /// Forget everything about partitions that are no longer assigned.
    pub fn revoke(&self, partitions: &[i32]) {
        if let Ok(mut tracked) = self.partitions.lock() {
            for partition in partitions {
                tracked.remove(partition);
            }
        }
    }

    pub fn pending(&self, partition: i32) -> usize {
        self.partitions
            .lock()
            .ok()
            .and_then(|p| p.get(&partition).map(|o| o.pending.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acks_advance() {
        let tracker = OffsetTracker::new();
        tracker.track(0, 10);
        tracker.track(0, 11);

        assert_eq!(tracker.ack(0, 10), Some(10));
        assert_eq!(tracker.ack(0, 11), Some(11));
        assert_eq!(tracker.pending(0), 0);
    }

    #[test]
    fn test_out_of_order_acks_wait_for_gap() {
        let tracker = OffsetTracker::new();
        for offset in 5..=8 {
            tracker.track(0, offset);
        }

        assert_eq!(tracker.ack(0, 7), None);
        assert_eq!(tracker.ack(0, 6), None);
        assert_eq!(tracker.ack(0, 5), Some(7));
        assert_eq!(tracker.ack(0, 8), Some(8));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = OffsetTracker::new();
        tracker.track(0, 1);
        tracker.track(1, 1);
        tracker.track(1, 2);

        assert_eq!(tracker.ack(1, 2), None);
        assert_eq!(tracker.ack(0, 1), Some(1));
        assert_eq!(tracker.ack(1, 1), Some(2));
    }

    #[test]
    fn test_unsettled_offset_holds_watermark() {
        let tracker = OffsetTracker::new();
        tracker.track(0, 1);
        tracker.track(0, 2);

        // offset 1 is still being processed
        assert_eq!(tracker.ack(0, 2), None);
        assert_eq!(tracker.pending(0), 1);
    }

    #[test]
    fn test_rewind_forgets_redelivered_offsets() {
        let tracker = OffsetTracker::new();
        for offset in 1..=4 {
            tracker.track(0, offset);
        }
        assert_eq!(tracker.ack(0, 1), Some(1));
        assert_eq!(tracker.ack(0, 3), None);

        tracker.rewind(0, 2, || Ok::<(), ()>(())).unwrap();
        assert_eq!(tracker.pending(0), 0);
        // a late ack from before the rewind is ignored
        assert_eq!(tracker.ack(0, 4), None);

        // the redelivered copies settle normally
        tracker.track(0, 2);
        tracker.track(0, 3);
        assert_eq!(tracker.ack(0, 3), None);
        assert_eq!(tracker.ack(0, 2), Some(3));
    }

    #[test]
    fn test_failed_seek_keeps_offset_pending() {
        let tracker = OffsetTracker::new();
        tracker.track(0, 1);
        tracker.track(0, 2);

        assert_eq!(tracker.rewind(0, 1, || Err("seek timed out")), Err("seek timed out"));
        assert_eq!(tracker.ack(0, 2), None);
        assert_eq!(tracker.pending(0), 1);
    }

    #[test]
    fn test_revoked_partition_ignores_late_acks() {
        let tracker = OffsetTracker::new();
        tracker.track(3, 40);
        tracker.revoke(&[3]);

        assert_eq!(tracker.ack(3, 40), None);
    }
}
