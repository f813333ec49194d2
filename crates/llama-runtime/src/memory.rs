//! Host memory query.
//!
//! Reports available physical memory so loaders can log how much headroom a
//! model will have. Only Linux `/proc/meminfo` is read; elsewhere the query
//! reports nothing.

use std::fs;

const MEMINFO: &str = "/proc/meminfo";

/// Available physical memory in bytes, or `None` when it cannot be determined.
pub fn available_memory() -> Option<u64> {
    let text = fs::read_to_string(MEMINFO).ok()?;
    parse_meminfo(&text)
}

/// Extract `MemAvailable` (reported in kB) from meminfo text, in bytes.
pub fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        kb.checked_mul(1024)
    })
}
