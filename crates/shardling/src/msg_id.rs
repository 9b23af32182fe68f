use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::PodAddress;

const SEQUENCE_BITS: i64 = 12;
const NODE_BITS: i64 = 10;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: i64 = (1 << NODE_BITS) - 1;

/// Process-local generator for message primary keys.
///
/// Produces time-ordered 64-bit ids packed as
/// `millis << 22 | node << 12 | sequence`. The node discriminator is
/// derived from the pod address so two pods started in the same
/// millisecond do not collide. Within one process, a CAS loop hands out
/// at most 4096 ids per millisecond and spills into the next millisecond
/// when the sequence overflows.
pub struct MessageIdGenerator {
    node: i64,
    /// Packed `(millis << SEQUENCE_BITS) | sequence` of the last id.
    last: AtomicI64,
}

impl MessageIdGenerator {
    pub fn new(pod: &PodAddress) -> Self {
        let node = (crate::hash::djb2_reverse(&pod.to_string()).unsigned_abs() as i64) & NODE_MASK;
        Self {
            node,
            last: AtomicI64::new(0),
        }
    }

    /// Next unique id.
    pub fn next(&self) -> i64 {
        loop {
            let now = now_millis();
            let prev = self.last.load(Ordering::Acquire);
            let prev_millis = prev >> SEQUENCE_BITS;
            let prev_seq = prev & SEQUENCE_MASK;

            let (millis, seq) = if now > prev_millis {
                (now, 0)
            } else if prev_seq < SEQUENCE_MASK {
                (prev_millis, prev_seq + 1)
            } else {
                // Sequence exhausted for this millisecond; borrow the next one.
                (prev_millis + 1, 0)
            };

            let packed = (millis << SEQUENCE_BITS) | seq;
            if self
                .last
                .compare_exchange(prev, packed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (millis << (SEQUENCE_BITS + NODE_BITS)) | (self.node << SEQUENCE_BITS) | seq;
            }
        }
    }

    /// Next unique id rendered as a message primary key.
    pub fn next_key(&self) -> String {
        self.next().to_string()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
