//! Fuzz target for change-log entry parsing.
//!
//! Arbitrary JSON must never panic the parser, and any entry that parses
//! must carry the timestamp the lightweight reader sees.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_sync::oplog::{entry_timestamp, parse_entry};
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(Value::Object(raw)) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    // Should never panic
    let parsed = parse_entry(&raw);
    let ts = entry_timestamp(&raw);

    if let Ok(entry) = parsed {
        assert_eq!(Some(entry.ts), ts);
        let _ = entry.is_internal();
    }
});
