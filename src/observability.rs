//! Host resource probing.
//!
//! Per-user container caps are derived from the host's total memory. The
//! probe reads `/proc/meminfo` directly; on hosts without procfs (macOS dev
//! machines) a conservative default is used instead.

use log::warn;

/// Memory cap applied per user when the host probe fails.
pub const DEFAULT_MEMORY_PER_USER_MB: u64 = 512;

/// Total host memory in megabytes, if it can be determined.
pub fn total_memory_mb() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total_kb(&contents).map(|kb| kb / 1024)
}

/// Memory cap in MB for one user, dividing total host RAM across `max_users`.
pub fn memory_per_user_mb(max_users: u64) -> u64 {
    match total_memory_mb() {
        Some(total) => (total / max_users.max(1)).max(64),
        None => {
            warn!(
                "failed to read host memory info, using default of {} MB per user",
                DEFAULT_MEMORY_PER_USER_MB
            );
            DEFAULT_MEMORY_PER_USER_MB
        }
    }
}

fn parse_meminfo_total_kb(contents: &str) -> Option<u64> {
    contents
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_total() {
        let sample = "\
MemTotal:       16384256 kB
MemFree:         123456 kB
MemAvailable:    999999 kB
";
        assert_eq!(parse_meminfo_total_kb(sample), Some(16384256));
    }

    #[test]
    fn missing_mem_total_is_none() {
        assert_eq!(parse_meminfo_total_kb("MemFree: 1 kB\n"), None);
    }
}
