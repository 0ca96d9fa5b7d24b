//! Random submit/collect/release sequences never break depth accounting.

use proptest::prelude::*;

use ioqueue::{BackendMode, Completion, IoQueue, IoQueueConfig, SubmitErrorKind};

#[derive(Clone, Copy, Debug)]
enum Step {
    Submit,
    Collect,
    Release,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Submit),
        2 => Just(Step::Collect),
        2 => Just(Step::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn in_flight_never_exceeds_depth(
        depth in 1usize..8,
        workers in 1usize..3,
        steps in prop::collection::vec(step_strategy(), 1..80),
    ) {
        let mut q = IoQueue::<u32>::new(IoQueueConfig {
            backend: BackendMode::SyncOnly,
            ..IoQueueConfig::new(depth, workers)
        })
        .expect("create queue");

        let mut next_tag = 0u32;
        let mut submitted = 0usize;
        let mut held: Vec<Completion<u32>> = Vec::new();
        let mut released = Vec::new();

        for step in steps {
            match step {
                Step::Submit => {
                    let was_full = q.capacity() == 0;
                    match q.submit_nop(next_tag) {
                        Ok(()) => {
                            prop_assert!(!was_full);
                            submitted += 1;
                            next_tag += 1;
                        }
                        Err(err) => {
                            prop_assert!(was_full);
                            prop_assert_eq!(err.kind(), SubmitErrorKind::WouldBlock);
                        }
                    }
                }
                Step::Collect => {
                    let outstanding = submitted - held.len() - released.len();
                    match q.collect(true) {
                        Some(c) => {
                            prop_assert!(outstanding > 0);
                            held.push(c);
                        }
                        None => prop_assert_eq!(outstanding, 0),
                    }
                }
                Step::Release => {
                    if let Some(c) = held.pop() {
                        released.push(q.release(c));
                    }
                }
            }
            prop_assert!(q.in_flight() <= q.depth());
            prop_assert_eq!(q.in_flight(), submitted - released.len());
            prop_assert_eq!(q.capacity(), depth - q.in_flight());
        }

        for c in held.drain(..) {
            released.push(q.release(c));
        }
        while let Some(c) = q.collect(true) {
            released.push(q.release(c));
        }
        released.sort_unstable();
        prop_assert_eq!(released, (0..next_tag).collect::<Vec<_>>());
        q.destroy();
    }
}
