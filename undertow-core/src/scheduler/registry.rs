//! Registration bookkeeping shared between callers and the scheduler thread.
//!
//! The identity map is copy-on-write: every change publishes a fresh map, so
//! lock-free readers never see a half-applied update. New instances wait in a
//! pending list until the scheduler merges them at the start of a pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::PeerInstance;

/// Identity of a registered instance: the address of its shared allocation.
pub(crate) type InstanceKey = usize;

pub(crate) fn key_of<P: PeerInstance + ?Sized>(instance: &Arc<P>) -> InstanceKey {
    Arc::as_ptr(instance).cast::<()>() as usize
}

/// Flag shared by the identity map and the scheduled entry it created.
#[derive(Debug, Default)]
pub(crate) struct Registration {
    unregistered: AtomicBool,
}

impl Registration {
    fn mark_unregistered(&self) {
        self.unregistered.store(true, Ordering::Release);
    }

    fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::Acquire)
    }
}

/// A peer instance together with its scheduling state.
///
/// Owned by the scheduler thread once merged into the active list.
pub struct ScheduledInstance {
    instance: Arc<dyn PeerInstance>,
    registration: Arc<Registration>,
    next_tick_time: u64,
    last_tick_time: Option<u64>,
}

impl ScheduledInstance {
    pub fn instance(&self) -> &Arc<dyn PeerInstance> {
        &self.instance
    }

    /// Monotonic time at which the instance is next due.
    pub fn next_tick_time(&self) -> u64 {
        self.next_tick_time
    }

    /// Time of the most recent tick, if the instance has ticked.
    pub fn last_tick_time(&self) -> Option<u64> {
        self.last_tick_time
    }

    pub fn is_unregistered(&self) -> bool {
        self.registration.is_unregistered()
    }

    pub(crate) fn record_tick(&mut self, now: u64, next_tick_time: u64) {
        self.last_tick_time = Some(now);
        self.next_tick_time = next_tick_time;
    }
}

struct Pending {
    additions: Vec<ScheduledInstance>,
    rng: ChaCha8Rng,
}

pub(crate) struct Registry {
    identities: ArcSwap<HashMap<InstanceKey, Arc<Registration>>>,
    pending: Mutex<Pending>,
    dirty: AtomicBool,
}

impl Registry {
    pub(crate) fn new(jitter_seed: Option<u64>) -> Self {
        let rng = match jitter_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };
        Self {
            identities: ArcSwap::from_pointee(HashMap::new()),
            pending: Mutex::new(Pending {
                additions: Vec::new(),
                rng,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// Queues `instance` for admission with a jittered first tick in
    /// `[now, now + period)`.
    ///
    /// Returns false if the instance is already registered.
    pub(crate) fn register(&self, instance: Arc<dyn PeerInstance>, now: u64, period: u64) -> bool {
        let key = key_of(&instance);
        let mut pending = self.pending.lock();

        let current = self.identities.load();
        if current.contains_key(&key) {
            return false;
        }

        let registration = Arc::new(Registration::default());
        let mut identities = HashMap::clone(&current);
        identities.insert(key, Arc::clone(&registration));
        self.identities.store(Arc::new(identities));

        let jitter = if period > 0 {
            pending.rng.random_range(0..period)
        } else {
            0
        };
        pending.additions.push(ScheduledInstance {
            instance,
            registration,
            next_tick_time: now.saturating_add(jitter),
            last_tick_time: None,
        });
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Marks the instance behind `key` for removal.
    ///
    /// Returns false if no such instance is registered.
    pub(crate) fn unregister(&self, key: InstanceKey) -> bool {
        let _pending = self.pending.lock();

        let current = self.identities.load();
        let Some(registration) = current.get(&key) else {
            return false;
        };
        registration.mark_unregistered();

        let mut identities = HashMap::clone(&current);
        identities.remove(&key);
        self.identities.store(Arc::new(identities));
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Applies queued changes to `active`: drops unregistered entries and
    /// appends pending additions. Returns false if nothing changed.
    pub(crate) fn merge_into(&self, active: &mut Vec<ScheduledInstance>) -> bool {
        if !self.dirty.load(Ordering::Acquire) {
            return false;
        }

        let mut pending = self.pending.lock();
        self.dirty.store(false, Ordering::Release);
        active.retain(|scheduled| !scheduled.is_unregistered());
        active.extend(
            pending
                .additions
                .drain(..)
                .filter(|scheduled| !scheduled.is_unregistered()),
        );
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.identities.load().len()
    }

    pub(crate) fn contains(&self, key: InstanceKey) -> bool {
        self.identities.load().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl PeerInstance for Idle {
        fn tick(&self, _now_millis: u64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_is_pending_until_merge() {
        let registry = Registry::new(Some(7));
        let peer: Arc<dyn PeerInstance> = Arc::new(Idle);

        assert!(registry.register(Arc::clone(&peer), 1_000, 100));
        assert_eq!(registry.len(), 1);

        let mut active = Vec::new();
        assert!(registry.merge_into(&mut active));
        assert_eq!(active.len(), 1);
        assert!(!registry.merge_into(&mut active));
    }

    #[test]
    fn test_jitter_stays_within_one_period() {
        let registry = Registry::new(Some(99));
        let peers: Vec<Arc<dyn PeerInstance>> = (0..64).map(|_| Arc::new(Idle) as _).collect();
        for peer in &peers {
            registry.register(Arc::clone(peer), 5_000, 50);
        }

        let mut active = Vec::new();
        registry.merge_into(&mut active);

        assert_eq!(active.len(), 64);
        for scheduled in &active {
            assert!((5_000..5_050).contains(&scheduled.next_tick_time()));
            assert_eq!(scheduled.last_tick_time(), None);
        }
        let distinct: std::collections::HashSet<u64> =
            active.iter().map(ScheduledInstance::next_tick_time).collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_duplicate_register_is_rejected() {
        let registry = Registry::new(Some(1));
        let peer: Arc<dyn PeerInstance> = Arc::new(Idle);

        assert!(registry.register(Arc::clone(&peer), 0, 10));
        assert!(!registry.register(Arc::clone(&peer), 0, 10));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_before_merge_never_activates() {
        let registry = Registry::new(Some(1));
        let peer: Arc<dyn PeerInstance> = Arc::new(Idle);
        registry.register(Arc::clone(&peer), 0, 10);

        assert!(registry.unregister(key_of(&peer)));
        assert!(!registry.contains(key_of(&peer)));

        let mut active = Vec::new();
        registry.merge_into(&mut active);
        assert!(active.is_empty());
    }

    #[test]
    fn test_unregister_unknown_reports_false() {
        let registry = Registry::new(Some(1));
        let peer: Arc<dyn PeerInstance> = Arc::new(Idle);

        assert!(!registry.unregister(key_of(&peer)));
    }

    #[test]
    fn test_snapshot_taken_before_change_is_unaffected() {
        let registry = Registry::new(Some(3));
        let first: Arc<dyn PeerInstance> = Arc::new(Idle);
        registry.register(Arc::clone(&first), 0, 10);

        let snapshot = registry.identities.load_full();
        let second: Arc<dyn PeerInstance> = Arc::new(Idle);
        registry.register(Arc::clone(&second), 0, 10);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
