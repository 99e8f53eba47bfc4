//! Property-based tests for the producer lifecycle and retry arithmetic.
//!
//! Coverage:
//! - Status predicates and the transition relation
//! - Random operation sequences against a non-delivering producer
//! - Linear backoff delays
//! - Local message validation

use proptest::prelude::*;
use spout::{linear_delay, Message, Producer, ProducerConfig, ProducerError, Status};
use std::time::Duration;

fn status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Produce,
    Buffer,
    Flush,
    Disconnect,
    Close,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Produce),
        2 => Just(Op::Buffer),
        2 => Just(Op::Flush),
        2 => Just(Op::Disconnect),
        1 => Just(Op::Close),
    ]
}

// =============================================================================
// Status machine
// =============================================================================

proptest! {
    /// Every status satisfies exactly one of the per-status predicates.
    #[test]
    fn prop_exactly_one_predicate(s in status()) {
        let holds = [
            s.is_initial(),
            s.is_configured(),
            s.is_connected(),
            s.is_disconnecting(),
            s.is_disconnected(),
            s.is_closing(),
            s.is_closed(),
        ];
        prop_assert_eq!(holds.iter().filter(|h| **h).count(), 1);
    }

    #[test]
    fn prop_u8_roundtrip(s in status()) {
        prop_assert_eq!(Status::from_u8(s as u8), Some(s));
    }

    #[test]
    fn prop_unknown_u8_rejected(raw in 7u8..) {
        prop_assert_eq!(Status::from_u8(raw), None);
    }

    /// Closed is terminal and nothing transitions back to Initial.
    #[test]
    fn prop_closed_is_terminal(next in status(), from in status()) {
        prop_assert!(!Status::Closed.can_transition_to(next));
        prop_assert!(!from.can_transition_to(Status::Initial));
    }

    /// Only Closing reaches Closed once a transport may exist.
    #[test]
    fn prop_closed_reached_via_closing(from in status()) {
        if from.can_transition_to(Status::Closed) {
            prop_assert!(matches!(from, Status::Initial | Status::Configured | Status::Closing));
        }
    }

    #[test]
    fn prop_active_excludes_teardown(s in status()) {
        if s.is_active() {
            prop_assert!(!s.is_initial() && !s.is_closing() && !s.is_closed() && !s.is_disconnecting());
        }
    }
}

// =============================================================================
// Lifecycle walks
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every observed status change along a random walk is a legal transition,
    /// and nothing new is accepted once closed.
    #[test]
    fn prop_random_walk_follows_transitions(ops in prop::collection::vec(op(), 1..24)) {
        let producer = Producer::with_config(ProducerConfig::dummy()).unwrap();
        let mut previous = producer.status().unwrap();
        prop_assert_eq!(previous, Status::Configured);

        for op in ops {
            let outcome = match op {
                Op::Produce => producer.produce_async(Message::new("t", b"x".to_vec())).map(drop),
                Op::Buffer => producer.buffer(Message::new("t", b"x".to_vec())),
                Op::Flush => producer.flush_sync().map(drop),
                Op::Disconnect => producer.disconnect().map(drop),
                Op::Close => producer.close(),
            };
            let current = producer.status().unwrap();

            if previous.is_closed() {
                match op {
                    Op::Produce | Op::Buffer => prop_assert!(matches!(outcome, Err(ProducerError::Closed))),
                    // Nothing left to flush or disconnect
                    Op::Flush | Op::Disconnect | Op::Close => prop_assert!(outcome.is_ok()),
                }
            } else {
                prop_assert!(outcome.is_ok(), "{:?} failed in {}: {:?}", op, previous, outcome);
            }

            if current != previous {
                // Close passes through Closing on the way, so check the two-step path.
                let direct = previous.can_transition_to(current);
                let via_closing = previous.can_transition_to(Status::Closing)
                    && Status::Closing.can_transition_to(current);
                let via_disconnecting = previous.can_transition_to(Status::Disconnecting)
                    && Status::Disconnecting.can_transition_to(current);
                prop_assert!(direct || via_closing || via_disconnecting,
                    "illegal change {} -> {} on {:?}", previous, current, op);
            }
            previous = current;
        }

        producer.close().unwrap();
        prop_assert!(producer.status().unwrap().is_closed());
        prop_assert_eq!(producer.buffered(), 0);
    }
}

// =============================================================================
// Backoff and validation
// =============================================================================

proptest! {
    #[test]
    fn prop_linear_delay_monotonic(base_ms in 0u64..1_000, attempt in 0u32..1_000) {
        let base = Duration::from_millis(base_ms);
        prop_assert!(linear_delay(base, attempt) <= linear_delay(base, attempt + 1));
        prop_assert_eq!(linear_delay(base, attempt), base * attempt);
        prop_assert_eq!(linear_delay(base, 0), Duration::ZERO);
    }

    #[test]
    fn prop_linear_delay_saturates(attempt in 1u32..) {
        prop_assert_eq!(linear_delay(Duration::MAX, attempt), Duration::MAX);
    }

    /// Payloads above the limit are rejected locally and never reach the buffer.
    #[test]
    fn prop_payload_limit_enforced(limit in 1usize..64, size in 0usize..128) {
        let producer = Producer::with_config(ProducerConfig::dummy().with_max_payload_size(limit)).unwrap();
        let message = Message::new("t", vec![0u8; size]);
        let fits = message.size() <= limit;

        let outcome = producer.buffer(message);
        prop_assert_eq!(outcome.is_ok(), fits);
        if !fits {
            prop_assert!(matches!(outcome, Err(ProducerError::MessageInvalid(_))));
        }
        prop_assert_eq!(producer.buffered(), usize::from(fits));
        producer.close().unwrap();
    }
}
