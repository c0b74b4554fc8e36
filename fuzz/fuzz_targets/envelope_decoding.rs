#![no_main]

//! Fuzz target for queue message decoding and payload validation.
//!
//! Message bodies come from producers the worker does not control. Decoding
//! must never panic: anything that is not a valid envelope becomes a job
//! carrying its decode error, and every decoded job either builds an email
//! or fails validation.

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use missive_core::{Job, QueueKind, ReceiptHandle};
use missive_worker::HandlerRegistry;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    let received_at = Utc.timestamp_opt(0, 0).single().unwrap_or_default();
    let job = Job::decode(body, "fuzz", ReceiptHandle::new(QueueKind::Regular, "r"), received_at);

    match &job.decode_error {
        Some(_) => assert_eq!(job.id.as_str(), "fuzz"),
        None => {
            let registry = HandlerRegistry::with_builtin("fuzz@missive.test");
            if let Ok(handler) = registry.resolve(&job.job_type) {
                if let Ok(message) = handler.build(&job) {
                    assert!(message.validate().is_ok());
                }
            }

            let reencoded = job.envelope_for_attempt(job.attempt);
            let _ = serde_json::to_string(&reencoded);
        },
    }
});
