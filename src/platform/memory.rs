// logsieve - platform/memory.rs
//
// System memory reading for the adaptive memory usage policy.
//
// Linux reads `MemAvailable` from /proc/meminfo. Other platforms report
// `None` and the policy falls back to its configured default quota.

/// Bytes of memory currently available to new allocations, if known.
pub fn available_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(meminfo) => parse_available_bytes(&meminfo),
            Err(e) => {
                tracing::debug!(error = %e, "Cannot read /proc/meminfo");
                None
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Parse `MemAvailable: <n> kB` from meminfo text.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_available_bytes(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                parts[1].parse::<u64>().ok()
            } else {
                None
            }
        })
        .map(|kb| kb.saturating_mul(1_024))
}
