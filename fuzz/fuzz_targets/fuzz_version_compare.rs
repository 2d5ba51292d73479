#![no_main]

use libfuzzer_sys::fuzz_target;
use plugin_manager::version::{compare, is_newer};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (a, b) = text.split_once('|').unwrap_or((text, ""));

    let forward = compare(Some(a), Some(b));
    let backward = compare(Some(b), Some(a));
    assert!((-1..=1).contains(&forward));
    assert_eq!(forward, -backward);
    assert_eq!(compare(Some(a), Some(a)), 0);

    if is_newer(Some(a), Some(b)) {
        assert_eq!(forward, 1);
        assert!(!is_newer(Some(b), Some(a)));
    }
});
