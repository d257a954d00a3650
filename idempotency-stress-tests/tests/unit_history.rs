use std::time::{Duration, Instant};
use idempotency_stress_tests::history::{History, OpKind, OpOutcome, OpRecord, ViolationKind};

fn created(key: &str, body: &[u8], start: Instant, ack: Instant) -> OpRecord {
    OpRecord {
        client_start_ts: start,
        client_ack_ts: ack,
        key: key.to_string(),
        kind: OpKind::NewKey,
        outcome: OpOutcome::Created { body: body.to_vec() },
    }
}

fn replayed(key: &str, body: &[u8], start: Instant, ack: Instant) -> OpRecord {
    OpRecord {
        client_start_ts: start,
        client_ack_ts: ack,
        key: key.to_string(),
        kind: OpKind::RepeatKey,
        outcome: OpOutcome::Replayed { body: body.to_vec() },
    }
}

fn mismatched(key: &str, start: Instant, ack: Instant) -> OpRecord {
    OpRecord {
        client_start_ts: start,
        client_ack_ts: ack,
        key: key.to_string(),
        kind: OpKind::MismatchKey,
        outcome: OpOutcome::Mismatched,
    }
}

fn after(t: Instant) -> Instant {
    t + Duration::from_millis(1)
}

fn ts4() -> (Instant, Instant, Instant, Instant) {
    let t0 = Instant::now();
    (t0, after(t0), after(after(t0)), after(after(after(t0))))
}

#[test]
fn test_empty_history_has_no_violations() {
    assert!(History(vec![]).check_correctness().is_empty());
}

#[test]
fn test_no_violation_when_replay_matches_the_original() {
    let (t0, t1, t2, t3) = ts4();
    let h = History(vec![created("k", b"hello", t0, t1), replayed("k", b"hello", t2, t3)]);
    assert!(h.check_correctness().is_empty());
}

#[test]
fn test_no_violation_for_mismatched_key_reuse() {
    let (t0, t1, t2, t3) = ts4();
    let h = History(vec![created("k", b"hello", t0, t1), mismatched("k", t2, t3)]);
    assert!(h.check_correctness().is_empty());
}

#[test]
fn test_duplicate_execution_when_two_created_bodies_disagree() {
    let (t0, t1, t2, t3) = ts4();
    let h = History(vec![created("k", b"hello", t0, t1), created("k", b"world", t2, t3)]);
    let v = h.check_correctness();
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].key, "k");
    assert!(matches!(
        &v[0].kind,
        ViolationKind::DuplicateExecution { first_body, second_body }
            if first_body == b"hello" && second_body == b"world"
    ));
}

#[test]
fn test_duplicate_execution_uses_the_earliest_created_as_the_origin() {
    // Order in the vec shouldn't matter — the earliest-started Created wins as origin,
    // so the later one is flagged regardless of how the records were pushed.
    let (t0, t1, t2, t3) = ts4();
    let h = History(vec![created("k", b"second", t2, t3), created("k", b"first", t0, t1)]);
    let v = h.check_correctness();
    assert_eq!(v.len(), 1);
    assert!(matches!(
        &v[0].kind,
        ViolationKind::DuplicateExecution { first_body, second_body }
            if first_body == b"first" && second_body == b"second"
    ));
}

#[test]
fn test_stale_replay_when_body_disagrees_with_origin() {
    let (t0, t1, t2, t3) = ts4();
    let h = History(vec![created("k", b"hello", t0, t1), replayed("k", b"goodbye", t2, t3)]);
    let v = h.check_correctness();
    assert_eq!(v.len(), 1);
    assert!(matches!(
        &v[0].kind,
        ViolationKind::StaleReplay { expected, actual }
            if expected == b"hello" && actual == b"goodbye"
    ));
}

#[test]
fn test_replay_without_origin() {
    let (t0, t1, ..) = ts4();
    let h = History(vec![replayed("k", b"ghost", t0, t1)]);
    let v = h.check_correctness();
    assert_eq!(v.len(), 1);
    assert!(matches!(&v[0].kind, ViolationKind::ReplayWithoutOrigin { actual } if actual == b"ghost"));
}

#[test]
fn test_independent_keys_do_not_interfere() {
    let (t0, t1, t2, t3) = ts4();
    let h = History(vec![created("k1", b"a", t0, t1), created("k2", b"b", t2, t3)]);
    assert!(h.check_correctness().is_empty());
}
