use crate::docker::ContainerId;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// How long `reserve` sleeps between retries while every slot is taken
const RESERVE_POLL: Duration = Duration::from_millis(100);

/// Outcome of a reservation: which waiter queue handles the packet, and
/// whether the container already had a waiter working on it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reservation {
    pub slot: u16,
    pub reused: bool,
}

/// The waiter slot table, owned by the orchestrator
///
/// Index i mirrors kernel queue i. Slot 0 belongs to the trigger queue
/// and is never handed out. Waiters do not touch the table; they announce
/// a finished slot over the release channel and the orchestrator clears
/// it here.
pub struct WaiterPool {
    slots: Vec<Option<ContainerId>>,
    release_rx: UnboundedReceiver<u16>,
}

impl WaiterPool {
    pub fn new(queues: u16) -> (Self, UnboundedSender<u16>) {
        let (release_tx, release_rx) = unbounded_channel();
        let pool = WaiterPool {
            slots: vec![None; usize::from(queues)],
            release_rx,
        };
        (pool, release_tx)
    }

    /// Apply any release signals waiters have sent since the last call
    pub fn drain_releases(&mut self) {
        while let Ok(slot) = self.release_rx.try_recv() {
            debug!(slot, "waiter released");
            self.free(slot);
        }
    }

    /// Clear one slot; harmless if it is already free
    pub fn free(&mut self, slot: u16) {
        if let Some(state) = self.slots.get_mut(usize::from(slot)) {
            *state = None;
        }
    }

    /// The slot handling `id`, reusing an existing assignment if one is
    /// in flight; blocks until a slot frees when the pool is full
    pub fn reserve(&mut self, id: &ContainerId) -> Reservation {
        loop {
            self.drain_releases();
            if let Some(slot) = self.assigned_to(id) {
                return Reservation { slot, reused: true };
            }
            if let Some(slot) = self.first_free() {
                self.slots[usize::from(slot)] = Some(id.clone());
                return Reservation {
                    slot,
                    reused: false,
                };
            }
            thread::sleep(RESERVE_POLL);
        }
    }

    pub fn assigned(&self) -> usize {
        self.slots.iter().skip(1).filter(|slot| slot.is_some()).count()
    }

    fn assigned_to(&self, id: &ContainerId) -> Option<u16> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.as_ref() == Some(id))
            .map(|(i, _)| i as u16)
    }

    fn first_free(&self) -> Option<u16> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn id(name: &str) -> ContainerId {
        ContainerId::new(name)
    }

    #[test]
    fn fresh_reservation_takes_lowest_free_slot() {
        let (mut pool, _tx) = WaiterPool::new(4);
        assert_eq!(
            pool.reserve(&id("app-a")),
            Reservation {
                slot: 1,
                reused: false
            }
        );
    }

    #[test]
    fn same_container_reuses_its_slot() {
        let (mut pool, _tx) = WaiterPool::new(4);
        let first = pool.reserve(&id("app-a"));
        let second = pool.reserve(&id("app-a"));
        assert_eq!(second.slot, first.slot);
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(pool.assigned(), 1);
    }

    #[test]
    fn distinct_containers_get_distinct_slots() {
        let (mut pool, _tx) = WaiterPool::new(4);
        let a = pool.reserve(&id("app-a"));
        let b = pool.reserve(&id("app-b"));
        let c = pool.reserve(&id("app-c"));
        assert_ne!(a.slot, b.slot);
        assert_ne!(b.slot, c.slot);
        assert_ne!(a.slot, c.slot);
        assert_eq!(pool.assigned(), 3);
    }

    #[test]
    fn slot_zero_is_never_pooled() {
        let (mut pool, _tx) = WaiterPool::new(2);
        assert_eq!(pool.reserve(&id("app-a")).slot, 1);
    }

    #[test]
    fn released_slot_is_reassignable() {
        let (mut pool, tx) = WaiterPool::new(2);
        let first = pool.reserve(&id("app-a"));
        tx.send(first.slot).unwrap();
        pool.drain_releases();
        assert_eq!(pool.assigned(), 0);
        let second = pool.reserve(&id("app-b"));
        assert_eq!(second.slot, first.slot);
        assert!(!second.reused);
    }

    #[test]
    fn double_release_is_harmless() {
        let (mut pool, tx) = WaiterPool::new(2);
        let r = pool.reserve(&id("app-a"));
        tx.send(r.slot).unwrap();
        tx.send(r.slot).unwrap();
        pool.drain_releases();
        assert_eq!(pool.assigned(), 0);
    }

    #[test]
    fn full_pool_blocks_until_a_release_arrives() {
        let (mut pool, tx) = WaiterPool::new(2);
        let held = pool.reserve(&id("app-a"));
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.send(held.slot).unwrap();
        });
        let started = Instant::now();
        let next = pool.reserve(&id("app-b"));
        assert_eq!(next.slot, 1);
        assert!(started.elapsed() >= Duration::from_millis(50));
        releaser.join().unwrap();
    }
}
