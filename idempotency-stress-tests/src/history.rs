use std::collections::HashMap;
use std::time::Instant;

pub enum OpKind {
    NewKey,
    RepeatKey,
    MismatchKey,
}

pub enum OpOutcome {
    /// The request was accepted and executed the handler. `body` is the response bytes
    /// (needed for correctness checking of later replays).
    Created { body: Vec<u8> },
    /// The server recognized the key and replayed a previously recorded response.
    Replayed { body: Vec<u8> },
    /// The server rejected the request because the key was reused with a different body.
    Mismatched,
    /// 5xx, connection failure, or any other unexpected outcome.
    Error,
}

pub struct OpRecord {
    /// When the client sent the request.
    pub client_start_ts: Instant,
    /// When the client received the response (the ACK).
    pub client_ack_ts: Instant,
    pub key: String,
    pub kind: OpKind,
    pub outcome: OpOutcome,
}

pub struct History(pub Vec<OpRecord>);

pub enum ViolationKind {
    /// Two `Created` responses were observed for the same key with different bodies —
    /// proof that the handler ran twice under one idempotency key.
    DuplicateExecution { first_body: Vec<u8>, second_body: Vec<u8> },
    /// A replay returned a body that does not match the key's original `Created` response.
    StaleReplay { expected: Vec<u8>, actual: Vec<u8> },
    /// A replay was observed for a key with no recorded `Created` response at all.
    ReplayWithoutOrigin { actual: Vec<u8> },
}

pub struct Violation {
    pub key: String,
    pub kind: ViolationKind,
}

impl History {
    /// Check every `Created`/`Replayed` outcome against the key's first recorded
    /// execution. `Mismatched` outcomes need no check — they are the expected result
    /// of a `MismatchKey` op and carry no body to compare.
    pub fn check_correctness(&self) -> Vec<Violation> {
        let origins = build_origin_index(&self.0);

        self.0
            .iter()
            .filter_map(|r| match &r.outcome {
                OpOutcome::Created { body } => {
                    let origin = origins.get(&r.key)?;
                    if origin.body != *body {
                        Some(Violation {
                            key: r.key.clone(),
                            kind: ViolationKind::DuplicateExecution {
                                first_body: origin.body.clone(),
                                second_body: body.clone(),
                            },
                        })
                    } else {
                        None
                    }
                }
                OpOutcome::Replayed { body } => match origins.get(&r.key) {
                    Some(origin) if origin.body == *body => None,
                    Some(origin) => Some(Violation {
                        key: r.key.clone(),
                        kind: ViolationKind::StaleReplay { expected: origin.body.clone(), actual: body.clone() },
                    }),
                    None => Some(Violation {
                        key: r.key.clone(),
                        kind: ViolationKind::ReplayWithoutOrigin { actual: body.clone() },
                    }),
                },
                _ => None,
            })
            .collect()
    }
}

struct Origin {
    body: Vec<u8>,
    start_ts: Instant,
}

/// key → the earliest-started `Created` response observed for it. Ties on start time are
/// broken arbitrarily; a genuine fencing violation will disagree on body regardless of
/// which `Created` record is picked as the origin.
fn build_origin_index(records: &[OpRecord]) -> HashMap<String, Origin> {
    let mut index: HashMap<String, Origin> = HashMap::new();
    for r in records {
        if let OpOutcome::Created { body } = &r.outcome {
            match index.get(&r.key) {
                Some(existing) if existing.start_ts <= r.client_start_ts => {}
                _ => {
                    index.insert(r.key.clone(), Origin { body: body.clone(), start_ts: r.client_start_ts });
                }
            }
        }
    }
    index
}
