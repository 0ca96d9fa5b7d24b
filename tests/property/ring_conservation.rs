//! Concurrent producers and consumers neither lose nor duplicate values.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use ioqueue::stdx::{MonitorPool, RingQueue};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn values_are_conserved(
        capacity in 1usize..64,
        producers in 1usize..4,
        consumers in 1usize..4,
        per_producer in 0usize..300,
        polling_consumer in any::<bool>(),
    ) {
        let ring = Arc::new(RingQueue::new(
            capacity,
            Arc::new(MonitorPool::for_slots(capacity)),
        ));
        let total = producers * per_producer;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        ring.push((p * per_producer + i + 1) as u64);
                    }
                })
            })
            .collect();

        // Split `total` pops over the consumers; one of them may poll.
        let consumers: Vec<_> = (0..consumers)
            .map(|c| {
                let ring = Arc::clone(&ring);
                let share = total / consumers + usize::from(c < total % consumers);
                let poll = polling_consumer && c == 0;
                thread::spawn(move || {
                    let mut got = Vec::with_capacity(share);
                    while got.len() < share {
                        match ring.pop(!poll || got.len() % 2 == 1) {
                            Some(v) => got.push(v),
                            None => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        for h in handles {
            h.join().expect("producer panicked");
        }
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|h| h.join().expect("consumer panicked"))
            .collect();
        all.sort_unstable();
        prop_assert_eq!(all, (1..=total as u64).collect::<Vec<_>>());
    }
}
