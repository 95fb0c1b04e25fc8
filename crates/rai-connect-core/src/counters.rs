use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic proxy counters. Increment-only while the proxy runs; readers
/// may observe the three values at slightly different instants but never
/// see any of them decrease.
#[derive(Debug, Default)]
pub struct Counters {
    requests_proxied: AtomicU64,
    beatmaps_downloaded: AtomicU64,
    bancho_packets_injected: AtomicU64,
}

/// Point-in-time copy of the counters for serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub requests_proxied: u64,
    pub beatmaps_downloaded: u64,
    pub bancho_packets_injected: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.requests_proxied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_beatmaps(&self) {
        self.beatmaps_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_injected(&self, count: u64) {
        if count > 0 {
            self.bancho_packets_injected
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests_proxied: self.requests_proxied.load(Ordering::Relaxed),
            beatmaps_downloaded: self.beatmaps_downloaded.load(Ordering::Relaxed),
            bancho_packets_injected: self.bancho_packets_injected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let snapshot = Counters::new().snapshot();
        assert_eq!(snapshot.requests_proxied, 0);
        assert_eq!(snapshot.beatmaps_downloaded, 0);
        assert_eq!(snapshot.bancho_packets_injected, 0);
    }

    #[test]
    fn test_counters_never_decrease() {
        let counters = Counters::new();
        let mut last = counters.snapshot();
        for i in 0..100 {
            counters.inc_requests();
            if i % 3 == 0 {
                counters.inc_beatmaps();
            }
            counters.add_injected(i % 2);
            let now = counters.snapshot();
            assert!(now.requests_proxied >= last.requests_proxied);
            assert!(now.beatmaps_downloaded >= last.beatmaps_downloaded);
            assert!(now.bancho_packets_injected >= last.bancho_packets_injected);
            last = now;
        }
        assert_eq!(last.requests_proxied, 100);
    }

    #[test]
    fn test_add_injected_zero_is_noop() {
        let counters = Counters::new();
        counters.add_injected(0);
        assert_eq!(counters.snapshot().bancho_packets_injected, 0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_string(&Counters::new().snapshot()).unwrap();
        assert!(json.contains("requestsProxied"));
        assert!(json.contains("beatmapsDownloaded"));
        assert!(json.contains("banchoPacketsInjected"));
    }
}
