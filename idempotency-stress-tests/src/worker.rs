use rand::Rng;
use std::time::{Duration, Instant};

use crate::history::{History, OpKind, OpOutcome, OpRecord};
use crate::metrics::Metrics;
use crate::workload::{Op, WorkloadProfile};

struct IssuedKey {
    key: String,
    amount: u64,
}

/// Drive `base_url` with `profile` for `duration`, recording every operation.
/// Returns raw metrics and the full operation history for post-run correctness checking.
pub async fn run(base_url: &str, profile: WorkloadProfile, key_space: usize, duration: Duration) -> (Metrics, History) {
    let client = reqwest::Client::new();
    let mut rng = rand::thread_rng();
    let mut records: Vec<OpRecord> = Vec::new();
    let mut requests_total: u64 = 0;
    let mut errors_5xx: u64 = 0;
    let mut latency_ns: Vec<u64> = Vec::new();

    // Pool of keys issued so far, bounded by `key_space` so RepeatKey/MismatchKey ops
    // have a realistic chance of landing on an already-used key once the pool fills up.
    let mut issued: Vec<IssuedKey> = Vec::with_capacity(key_space);
    let mut next_key_id: u64 = 0;

    let run_start = Instant::now();

    while run_start.elapsed() < duration {
        let mut op = profile.sample(&mut rng);
        if issued.is_empty() && op != Op::NewKey {
            op = Op::NewKey;
        }

        let op_start = Instant::now();
        let (kind, key, outcome) = execute_op(&client, base_url, op, &mut issued, &mut next_key_id, key_space, &mut rng).await;
        let op_end = Instant::now();

        if is_error(&outcome) {
            errors_5xx += 1;
        }

        requests_total += 1;
        latency_ns.push((op_end - op_start).as_nanos() as u64);
        records.push(OpRecord { client_start_ts: op_start, client_ack_ts: op_end, key, kind, outcome });
    }

    let elapsed_secs = run_start.elapsed().as_secs_f64();
    let metrics = Metrics { requests_total, errors_5xx, latency_ns, elapsed_secs };
    (metrics, History(records))
}

async fn execute_op(
    client: &reqwest::Client,
    base_url: &str,
    op: Op,
    issued: &mut Vec<IssuedKey>,
    next_key_id: &mut u64,
    key_space: usize,
    rng: &mut impl Rng,
) -> (OpKind, String, OpOutcome) {
    match op {
        Op::NewKey => {
            let key = format!("key_{}", *next_key_id);
            *next_key_id += 1;
            let amount = generate_amount(rng);
            let outcome = post_payment(client, base_url, &key, amount).await;
            if let OpOutcome::Created { .. } = &outcome {
                if issued.len() >= key_space {
                    issued.remove(0);
                }
                issued.push(IssuedKey { key: key.clone(), amount });
            }
            (OpKind::NewKey, key, outcome)
        }
        Op::RepeatKey => {
            let picked = &issued[rng.gen_range(0..issued.len())];
            let key = picked.key.clone();
            let amount = picked.amount;
            let outcome = post_payment(client, base_url, &key, amount).await;
            (OpKind::RepeatKey, key, outcome)
        }
        Op::MismatchKey => {
            let picked = &issued[rng.gen_range(0..issued.len())];
            let key = picked.key.clone();
            let amount = picked.amount.wrapping_add(1).max(1);
            let outcome = post_payment(client, base_url, &key, amount).await;
            (OpKind::MismatchKey, key, outcome)
        }
    }
}

async fn post_payment(client: &reqwest::Client, base_url: &str, key: &str, amount: u64) -> OpOutcome {
    let response = client
        .post(format!("{base_url}/payments"))
        .header("Idempotency-Key", key)
        .json(&serde_json::json!({ "amount": amount }))
        .send()
        .await;

    match response {
        Ok(r) => {
            let status = r.status();
            if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
                return OpOutcome::Mismatched;
            }
            if status.is_server_error() {
                return OpOutcome::Error;
            }
            let replayed = r.headers().get("Idempotency-Replayed").is_some();
            match r.bytes().await {
                Ok(body) if replayed => OpOutcome::Replayed { body: body.to_vec() },
                Ok(body) => OpOutcome::Created { body: body.to_vec() },
                Err(_) => OpOutcome::Error,
            }
        }
        Err(_) => OpOutcome::Error,
    }
}

/// Generate a random payment amount for use in NewKey operations (1..100_000).
pub fn generate_amount(rng: &mut impl Rng) -> u64 {
    rng.gen_range(1..100_000)
}

/// Returns `true` if `outcome` represents a server-side error (5xx or network failure).
pub fn is_error(outcome: &OpOutcome) -> bool {
    matches!(outcome, OpOutcome::Error)
}
