#![cfg(all(test, feature = "loom"))]

use crate::region::HeapRegion;
use crate::ring::IndexRing;
use crate::spinlock::SpinLock;
use crate::sync::{AtomicU32, Ordering, thread};
use alloc::vec;
use alloc::vec::Vec;
use loom::sync::Arc;

#[test]
fn ring_producer_consumer() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(1024));
        let ring: IndexRing<u32> = unsafe { IndexRing::init(region_owner.region(), 0, 2) };

        let producer_ring = ring.clone();
        let producer_owner = region_owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            for i in 0..3u32 {
                while producer_ring.try_push(i).is_would_block() {
                    thread::yield_now();
                }
            }
        });

        let consumer_ring = ring.clone();
        let consumer_owner = region_owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let mut received = Vec::new();
            while received.len() < 3 {
                match consumer_ring.try_pop() {
                    Some(v) => received.push(v),
                    None => thread::yield_now(),
                }
            }
            received
        });

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    });
}

#[test]
fn ring_competing_consumers_claim_each_entry_once() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(1024));
        let ring: IndexRing<u32> = unsafe { IndexRing::init(region_owner.region(), 0, 4) };
        ring.try_push(10);
        ring.try_push(20);

        let spawn_consumer = |ring: IndexRing<u32>, owner: Arc<HeapRegion>| {
            thread::spawn(move || {
                let _keep = owner;
                let mut got = Vec::new();
                while let Some(v) = ring.try_pop() {
                    got.push(v);
                }
                got
            })
        };

        let a = spawn_consumer(ring.clone(), region_owner.clone());
        let b = spawn_consumer(ring.clone(), region_owner.clone());

        let mut all = a.join().unwrap();
        all.extend(b.join().unwrap());
        all.sort_unstable();
        assert_eq!(all, vec![10, 20]);
        assert!(ring.is_empty());
    });
}

#[test]
fn spinlock_mutual_exclusion() {
    loom::model(|| {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    let _guard = lock.lock_bounded(u32::MAX).unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(!lock.is_locked());
    });
}
