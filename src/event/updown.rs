//! Process-wide thread liveness registry.
//!
//! Two maps behind one mutex: current status per thread id, and the set of
//! subscriber thread ids per target. Subscribing to a thread that is already
//! up delivers the UP notification immediately (through the subscriber's
//! inbox, like every other delivery). Down transitions are recorded but not
//! propagated to subscribers; the asymmetry is inherited from the observed
//! behavior of this fabric and kept deliberate.

use super::inbox::UpDownStatus;
use super::thread::{table_get, MAX_THREAD_ID};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

struct RegistryInner {
    status: BTreeMap<u32, UpDownStatus>,
    subscriptions: BTreeMap<u32, BTreeSet<u32>>,
}

/// The up/down registry.
pub(crate) struct UpDownRegistry {
    inner: Mutex<RegistryInner>,
}

static REGISTRY: UpDownRegistry = UpDownRegistry {
    inner: Mutex::new(RegistryInner {
        status: BTreeMap::new(),
        subscriptions: BTreeMap::new(),
    }),
};

pub(crate) fn registry() -> &'static UpDownRegistry {
    &REGISTRY
}

impl UpDownRegistry {
    /// Records `subscriber`'s interest in `target` going up. If the target
    /// is already up, the notification is delivered right away.
    pub(crate) fn subscribe(&self, subscriber: u32, target: u32) {
        assert_ne!(subscriber, target, "self-subscription is not allowed");
        assert!(subscriber <= MAX_THREAD_ID);
        assert!(target <= MAX_THREAD_ID);

        let mut inner = self.inner.lock();
        if inner.status.get(&target) == Some(&UpDownStatus::Up) {
            deliver_up(subscriber, target);
        }
        inner.subscriptions.entry(target).or_default().insert(subscriber);
    }

    /// Marks `thread_id` up and notifies every current subscriber.
    pub(crate) fn up(&self, thread_id: u32) {
        assert!(thread_id <= MAX_THREAD_ID);
        let mut inner = self.inner.lock();
        assert!(
            inner.status.get(&thread_id) != Some(&UpDownStatus::Up),
            "thread {thread_id} is already up"
        );
        inner.status.insert(thread_id, UpDownStatus::Up);
        if let Some(subscribers) = inner.subscriptions.get(&thread_id) {
            for &subscriber in subscribers {
                deliver_up(subscriber, thread_id);
            }
        }
    }

    /// Marks `thread_id` down. Subscribers are not notified.
    pub(crate) fn down(&self, thread_id: u32) {
        assert!(thread_id <= MAX_THREAD_ID);
        self.inner
            .lock()
            .status
            .insert(thread_id, UpDownStatus::Down);
    }
}

fn deliver_up(subscriber: u32, target: u32) {
    match table_get(subscriber) {
        Some(thread) => thread.notify_thread_up(target),
        None => warn!(subscriber, target, "up-notification for unregistered subscriber"),
    }
}
