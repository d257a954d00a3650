use rand::{rngs::StdRng, SeedableRng};
use idempotency_stress_tests::history::OpOutcome;
use idempotency_stress_tests::worker::{generate_amount, is_error};

// `worker::run` requires a live HTTP server and is inherently integration-level.
// The two helpers exposed by worker.rs cover all of the pure, testable logic.

#[test]
fn test_generate_amount_and_is_error() {
    let mut rng = StdRng::seed_from_u64(42);

    // generate_amount: must always land in 1..100_000 and content must vary.
    let mut all_same = true;
    let mut prev: Option<u64> = None;
    for _ in 0..50 {
        let v = generate_amount(&mut rng);
        assert!(v >= 1, "amount too small: {v}");
        assert!(v < 100_000, "amount too large: {v}");
        if let Some(p) = prev {
            if p != v {
                all_same = false;
            }
        }
        prev = Some(v);
    }
    assert!(!all_same, "generate_amount returned the same value every time");

    // is_error: only OpOutcome::Error should return true.
    assert!(is_error(&OpOutcome::Error));
    assert!(!is_error(&OpOutcome::Mismatched));
    assert!(!is_error(&OpOutcome::Created { body: vec![1] }));
    assert!(!is_error(&OpOutcome::Replayed { body: vec![1] }));
}
