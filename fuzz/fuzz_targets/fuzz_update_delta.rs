//! Fuzz target for update deltas.
//!
//! Parses arbitrary `o` documents as operator or diff updates and applies
//! them to an arbitrary document. Failure is fine; panics are not.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_sync::UpdateDelta;
use serde_json::Value;

fuzz_target!(|data: (&[u8], &[u8])| {
    let (update, document) = data;
    let Ok(Value::Object(o)) = serde_json::from_slice::<Value>(update) else {
        return;
    };
    let Ok(Value::Object(mut doc)) = serde_json::from_slice::<Value>(document) else {
        return;
    };

    let Ok(delta) = UpdateDelta::from_operators(&o) else {
        return;
    };
    let _ = delta.to_operator_document();
    let _ = delta.apply_to(&mut doc);
});
