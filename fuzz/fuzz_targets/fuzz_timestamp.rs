//! Fuzz target for timestamp text parsing and ordering.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_sync::Timestamp;

fuzz_target!(|data: (&str, u32, u32, u32)| {
    let (text, time, increment, now) = data;

    // Should never panic
    if let Ok(ts) = text.parse::<Timestamp>() {
        assert_eq!(ts.to_string().parse::<Timestamp>().ok(), Some(ts));
    }

    let ts = Timestamp::new(time, increment);
    if time < u32::MAX || increment < u32::MAX {
        assert!(ts.successor(now) > ts);
    }
    let _ = ts.lag_secs(i64::from(now));
    let _ = ts.to_datetime();
});
