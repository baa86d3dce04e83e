//! Metrics Sink: a process-wide request counter registry, keyed by the
//! configured `metricsKeys` namespace plus the request method. Grounded on
//! `local_fanout::REGISTRY`'s `OnceLock`-backed singleton pattern, generalized
//! from a fixed counter set to an open key space.

use std::collections::HashMap;
use std::sync::{atomic::AtomicU64, atomic::Ordering, Mutex, OnceLock};

const DEFAULT_KEY1: &str = "httpcap";
const DEFAULT_KEY2: &str = "req";

fn registry() -> &'static Mutex<HashMap<(String, String, String), AtomicU64>> {
    static REGISTRY: OnceLock<Mutex<HashMap<(String, String, String), AtomicU64>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// `metrics_keys` supplies `(key1, key2)`; missing entries fall back to
/// `httpcap`/`req` (spec §4.6's default namespace).
fn namespace(metrics_keys: &[String]) -> (String, String) {
    let key1 = metrics_keys
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_KEY1.to_owned());
    let key2 = metrics_keys
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_KEY2.to_owned());
    (key1, key2)
}

/// Increment the counter for this namespace/method pair. A no-op disables
/// nothing here; callers simply skip calling this when metrics are unwanted.
pub fn record(metrics_keys: &[String], method: &str) {
    let (key1, key2) = namespace(metrics_keys);
    let map = registry();
    let guard = map.lock().expect("metrics registry mutex poisoned");
    if let Some(counter) = guard.get(&(key1.clone(), key2.clone(), method.to_owned())) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    drop(guard);

    let mut guard = map.lock().expect("metrics registry mutex poisoned");
    guard
        .entry((key1, key2, method.to_owned()))
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

/// Snapshot every counter currently tracked, as `(key1, key2, method, count)`.
pub fn snapshot() -> Vec<(String, String, String, u64)> {
    registry()
        .lock()
        .expect("metrics registry mutex poisoned")
        .iter()
        .map(|((k1, k2, m), c)| (k1.clone(), k2.clone(), m.clone(), c.load(Ordering::Relaxed)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_metrics_keys_configured() {
        assert_eq!(namespace(&[]), ("httpcap".to_owned(), "req".to_owned()));
    }

    #[test]
    fn explicit_keys_override_defaults() {
        assert_eq!(
            namespace(&["svc".to_owned(), "http".to_owned()]),
            ("svc".to_owned(), "http".to_owned())
        );
    }

    #[test]
    fn record_increments_the_matching_counter() {
        let keys = vec!["metrics_test_ns".to_owned(), "req".to_owned()];
        record(&keys, "GET");
        record(&keys, "GET");
        let count = snapshot()
            .into_iter()
            .find(|(k1, _, m, _)| k1 == "metrics_test_ns" && m == "GET")
            .map(|(_, _, _, c)| c)
            .unwrap_or(0);
        assert!(count >= 2);
    }
}
