//! Lock-free MPSC inbox for cross-thread message delivery.
//!
//! Producers from any thread enqueue envelopes; the owning event thread is
//! the only consumer and drops each envelope after dispatch. Ordering is
//! FIFO per producer (the queue is in fact globally FIFO).

use crossbeam_queue::SegQueue;
use std::any::Any;

/// Opaque message payload, owned by the consumer after dispatch.
pub type Payload = Box<dyn Any + Send>;

/// Liveness state carried by up/down envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpDownStatus {
    /// Thread is down.
    Down,
    /// Thread is up.
    Up,
}

/// One queued message.
pub(crate) enum Envelope {
    /// User payload for the thread's message callback.
    User(Payload),
    /// Thread liveness notification for a registered up-callback.
    UpDown {
        thread_id: u32,
        status: UpDownStatus,
    },
}

/// The per-thread message queue.
#[derive(Default)]
pub(crate) struct Inbox {
    queue: SegQueue<Envelope>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, envelope: Envelope) {
        self.queue.push(envelope);
    }

    pub(crate) fn pop(&self) -> Option<Envelope> {
        self.queue.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn fifo_per_producer() {
        let inbox = Inbox::new();
        for i in 0..10u32 {
            inbox.push(Envelope::User(Box::new(i)));
        }
        for i in 0..10u32 {
            match inbox.pop() {
                Some(Envelope::User(payload)) => {
                    assert_eq!(*payload.downcast_ref::<u32>().unwrap(), i);
                }
                other => unreachable!("expected user envelope, got none: {}", other.is_some()),
            }
        }
        assert!(inbox.is_empty());
    }

    #[test]
    fn multi_producer_single_consumer() {
        let inbox = Arc::new(Inbox::new());
        let producers = 5;
        let per_producer = 200u32;
        let barrier = Arc::new(Barrier::new(producers));

        let handles: Vec<_> = (0..producers as u32)
            .map(|p| {
                let inbox = Arc::clone(&inbox);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_producer {
                        inbox.push(Envelope::User(Box::new((p, i))));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("producer");
        }

        assert_eq!(inbox.len(), producers * per_producer as usize);
        let mut last_seen = vec![None::<u32>; producers];
        while let Some(envelope) = inbox.pop() {
            let Envelope::User(payload) = envelope else {
                unreachable!("only user envelopes were queued");
            };
            let (p, i) = *payload.downcast_ref::<(u32, u32)>().unwrap();
            // Per-producer subsequence is strictly increasing.
            if let Some(prev) = last_seen[p as usize] {
                assert!(i > prev, "producer {p}: {i} after {prev}");
            }
            last_seen[p as usize] = Some(i);
        }
        for (p, last) in last_seen.iter().enumerate() {
            assert_eq!(*last, Some(per_producer - 1), "producer {p} complete");
        }
    }
}
