//! Reverse-DNS resolution with a bounded LRU cache.
//!
//! Hop IPs are looked up via PTR records. When no PTR record exists (or the
//! resolver fails), the sentinel [`NO_PTR`] is cached and returned so callers
//! can treat it as "no name" without retrying the lookup every cycle.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use dns_lookup::lookup_addr;

/// Sentinel returned when a PTR record is absent.
pub const NO_PTR: &str = "----------";

/// Performs the underlying PTR lookup. Injected so tests can count calls.
pub trait Resolve: Send + Sync {
    /// Look up the PTR record for `ip`. `None` means no usable hostname.
    fn reverse(&self, ip: &str) -> Option<String>;
}

/// System resolver backed by `dns_lookup::lookup_addr`.
///
/// Blocking; the enrichment sweep calls it through `spawn_blocking`.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn reverse(&self, ip: &str) -> Option<String> {
        let addr: IpAddr = ip.parse().ok()?;
        match lookup_addr(&addr) {
            // Some resolvers answer with the literal address when no PTR
            // record exists; that is not a name.
            Ok(name) if name != ip && !name.is_empty() => Some(name),
            _ => None,
        }
    }
}

struct CacheEntry {
    hostname: String,
    stamp: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
    hits: u64,
    misses: u64,
}

/// Cache-hit statistics for operational tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

/// Bounded reverse-DNS cache with least-recently-used eviction.
pub struct DnsCache {
    resolver: Box<dyn Resolve>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl DnsCache {
    /// Create a cache over the system resolver with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_resolver(capacity, Box::new(SystemResolver))
    }

    /// Create a cache over a custom resolver.
    pub fn with_resolver(capacity: usize, resolver: Box<dyn Resolve>) -> Self {
        Self {
            resolver,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Resolve `ip` to a hostname, or [`NO_PTR`] when none is available.
    ///
    /// An empty input returns the sentinel without a lookup or a cache
    /// write. Lookup failures are cached as the sentinel.
    pub fn resolve(&self, ip: &str) -> String {
        if ip.is_empty() {
            return NO_PTR.to_string();
        }

        {
            let mut state = self.state.lock().unwrap();
            state.clock += 1;
            let clock = state.clock;
            if let Some(entry) = state.entries.get_mut(ip) {
                entry.stamp = clock;
                let hostname = entry.hostname.clone();
                state.hits += 1;
                return hostname;
            }
            state.misses += 1;
        }

        // Resolve outside the lock so a slow PTR query cannot stall other
        // callers on a cache hit.
        let hostname = self
            .resolver
            .reverse(ip)
            .unwrap_or_else(|| NO_PTR.to_string());

        let mut state = self.state.lock().unwrap();
        if state.entries.len() >= self.capacity && !state.entries.contains_key(ip) {
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(ip, _)| ip.clone())
            {
                state.entries.remove(&oldest);
            }
        }
        state.clock += 1;
        let stamp = state.clock;
        state.entries.insert(
            ip.to_string(),
            CacheEntry {
                hostname: hostname.clone(),
                stamp,
            },
        );

        hostname
    }

    /// Flush the cache, forcing re-resolution of all hop IPs.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
    }

    /// Hit/miss counters and current occupancy.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            size: state.entries.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingResolver {
        calls: Arc<AtomicUsize>,
        answer: Option<String>,
    }

    impl Resolve for CountingResolver {
        fn reverse(&self, _ip: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn counting_cache(capacity: usize, answer: Option<&str>) -> (Arc<AtomicUsize>, DnsCache) {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = DnsCache::with_resolver(
            capacity,
            Box::new(CountingResolver {
                calls: calls.clone(),
                answer: answer.map(String::from),
            }),
        );
        (calls, cache)
    }

    #[test]
    fn test_repeated_lookup_resolves_once_until_clear() {
        let (calls, cache) = counting_cache(8, Some("router.example.net"));

        assert_eq!(cache.resolve("10.0.0.1"), "router.example.net");
        assert_eq!(cache.resolve("10.0.0.1"), "router.example.net");
        assert_eq!(cache.resolve("10.0.0.1"), "router.example.net");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.clear();
        assert_eq!(cache.resolve("10.0.0.1"), "router.example.net");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_ip_never_invokes_resolver() {
        let (calls, cache) = counting_cache(8, Some("x"));
        assert_eq!(cache.resolve(""), NO_PTR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_failure_caches_sentinel() {
        let (calls, cache) = counting_cache(8, None);
        assert_eq!(cache.resolve("10.0.0.1"), NO_PTR);
        assert_eq!(cache.resolve("10.0.0.1"), NO_PTR);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lru_eviction_drops_least_recently_used() {
        let (calls, cache) = counting_cache(2, Some("x"));
        cache.resolve("10.0.0.1");
        cache.resolve("10.0.0.2");
        cache.resolve("10.0.0.1"); // refresh 1 so 2 is oldest
        cache.resolve("10.0.0.3"); // evicts 2
        assert_eq!(cache.stats().size, 2);

        let before = calls.load(Ordering::SeqCst);
        cache.resolve("10.0.0.1"); // still cached
        assert_eq!(calls.load(Ordering::SeqCst), before);
        cache.resolve("10.0.0.2"); // evicted, so re-resolved
        assert_eq!(calls.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let (_calls, cache) = counting_cache(8, Some("x"));
        cache.resolve("10.0.0.1");
        cache.resolve("10.0.0.1");
        cache.resolve("10.0.0.2");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 2);
        assert_eq!(stats.capacity, 8);
    }
}
