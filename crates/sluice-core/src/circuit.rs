use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Result, SluiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Breakers are shared per adapter and remote origin (scheme + host).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub adapter: String,
    pub origin: String,
}

impl CircuitKey {
    pub fn new(adapter: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            origin: origin.into(),
        }
    }

    /// Key for a call to `url`; port, path and query do not matter.
    pub fn for_url(adapter: impl Into<String>, url: &str) -> Self {
        Self::new(adapter, origin_of(url))
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.adapter, self.origin)
    }
}

/// `scheme://host` of a URL, lowercased, without userinfo or port.
pub fn origin_of(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s.to_ascii_lowercase(), r),
        None => (String::new(), url),
    };
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    let host = if host_port.starts_with('[') {
        // IPv6 literal
        match host_port.find(']') {
            Some(end) => &host_port[..=end],
            None => host_port,
        }
    } else {
        host_port.split(':').next().unwrap_or_default()
    };
    let host = host.to_ascii_lowercase();
    if scheme.is_empty() {
        host
    } else {
        format!("{scheme}://{host}")
    }
}

/// State in the low two bits, the millisecond it last opened above them, so
/// a transition and its timestamp land in one compare-and-swap.
fn pack(state: u8, opened_at_ms: u64) -> u64 {
    (opened_at_ms << 2) | u64::from(state)
}

fn unpack(word: u64) -> (u8, u64) {
    ((word & 0b11) as u8, word >> 2)
}

struct Circuit {
    word: AtomicU64,
    failures: AtomicU32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(CLOSED, 0)),
            failures: AtomicU32::new(0),
        }
    }

    fn open_from(&self, current: u64, now: u64) -> bool {
        self.word
            .compare_exchange(current, pack(OPEN, now), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Circuit breakers shared by every run in the process.
///
/// The map lock is only held to find or insert a key; transitions use
/// compare-and-swap on the per-key atomics.
pub struct CircuitBreakers {
    config: CircuitConfig,
    epoch: Instant,
    circuits: RwLock<HashMap<CircuitKey, Arc<Circuit>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn circuit(&self, key: &CircuitKey) -> Arc<Circuit> {
        if let Ok(map) = self.circuits.read() {
            if let Some(c) = map.get(key) {
                return c.clone();
            }
        }
        match self.circuits.write() {
            Ok(mut map) => map
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Circuit::new()))
                .clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Circuit::new()))
                .clone(),
        }
    }

    pub fn state(&self, key: &CircuitKey) -> CircuitState {
        let (state, _) = unpack(self.circuit(key).word.load(Ordering::Acquire));
        CircuitState::from_u8(state)
    }

    /// Ask permission to call. Fails with `CircuitOpen` while the breaker is
    /// open, or while another caller holds the single half-open trial.
    pub fn try_acquire(&self, key: &CircuitKey) -> Result<()> {
        let circuit = self.circuit(key);
        let word = circuit.word.load(Ordering::Acquire);
        match unpack(word) {
            (CLOSED, _) => Ok(()),
            (OPEN, opened) => {
                let reset_ms = self.config.reset_timeout.as_millis() as u64;
                if self.now_ms().saturating_sub(opened) >= reset_ms
                    && circuit
                        .word
                        .compare_exchange(word, pack(HALF_OPEN, opened), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    info!(circuit = %key, "Circuit half-open, allowing trial call");
                    return Ok(());
                }
                Err(SluiceError::CircuitOpen {
                    key: key.to_string(),
                })
            }
            _ => Err(SluiceError::CircuitOpen {
                key: key.to_string(),
            }),
        }
    }

    pub fn record_success(&self, key: &CircuitKey) {
        let circuit = self.circuit(key);
        circuit.failures.store(0, Ordering::Release);
        let (previous, _) = unpack(circuit.word.swap(pack(CLOSED, 0), Ordering::AcqRel));
        if previous != CLOSED {
            info!(circuit = %key, "Circuit closed");
        }
    }

    /// Record a failed call. Returns `true` when this failure opened the circuit.
    ///
    /// A failure landing while the circuit is already open leaves its reset
    /// deadline alone.
    pub fn record_failure(&self, key: &CircuitKey) -> bool {
        let circuit = self.circuit(key);
        let now = self.now_ms();
        let word = circuit.word.load(Ordering::Acquire);

        match unpack(word) {
            (HALF_OPEN, _) => {
                let reopened = circuit.open_from(word, now);
                if reopened {
                    warn!(circuit = %key, "Trial call failed, circuit re-opened");
                }
                reopened
            }
            (CLOSED, _) => {
                let failures = circuit.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold && circuit.open_from(word, now) {
                    warn!(circuit = %key, failures, "Circuit opened");
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Run `op` under the breaker for `key`.
    pub async fn call<T, F, Fut>(&self, key: &CircuitKey, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire(key)?;
        match op().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(key);
                Err(e)
            }
        }
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(CircuitConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        })
    }

    async fn fail(b: &CircuitBreakers, key: &CircuitKey, calls: &AtomicUsize) -> Result<()> {
        b.call(key, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SluiceError::Http("503".into()))
        })
        .await
    }

    #[test]
    fn origin_ignores_port_path_and_userinfo() {
        assert_eq!(
            origin_of("https://user:pw@API.example.com:8443/v1/items?x=1"),
            "https://api.example.com"
        );
        assert_eq!(origin_of("http://[::1]:8080/x"), "http://[::1]");
        assert_eq!(
            CircuitKey::for_url("webhook", "https://h.io/a"),
            CircuitKey::for_url("webhook", "https://h.io:443/b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let b = breakers();
        let key = CircuitKey::for_url("http_json", "https://api.example.com/items");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(
                fail(&b, &key, &calls).await,
                Err(SluiceError::Http(_))
            ));
        }
        assert_eq!(b.state(&key), CircuitState::Open);

        let rejected = fail(&b, &key, &calls).await;
        assert!(matches!(rejected, Err(SluiceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn single_half_open_trial_then_close() {
        let b = breakers();
        let key = CircuitKey::for_url("webhook", "https://hooks.example.com");
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &key, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(b.try_acquire(&key).is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.try_acquire(&key).is_ok());
        assert_eq!(b.state(&key), CircuitState::HalfOpen);
        // Trial in flight: everyone else is rejected
        assert!(b.try_acquire(&key).is_err());

        b.record_success(&key);
        assert_eq!(b.state(&key), CircuitState::Closed);
        assert!(b.try_acquire(&key).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_for_new_window() {
        let b = breakers();
        let key = CircuitKey::new("webhook", "https://down.example.com");
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &key, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(matches!(
            fail(&b, &key, &calls).await,
            Err(SluiceError::Http(_))
        ));
        assert_eq!(b.state(&key), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.try_acquire(&key).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_keeps_the_reset_deadline() {
        let b = breakers();
        let key = CircuitKey::new("webhook", "https://slow.example.com");
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &key, &calls).await;
        }

        // A call admitted before the circuit opened fails afterwards
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!b.record_failure(&key));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.try_acquire(&key).is_ok());
        assert_eq!(b.state(&key), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let b = breakers();
        let key = CircuitKey::new("webhook", "https://flaky.example.com");
        let calls = AtomicUsize::new(0);
        let _ = fail(&b, &key, &calls).await;
        let _ = fail(&b, &key, &calls).await;
        b.call(&key, || async { Ok(()) }).await.unwrap();
        let _ = fail(&b, &key, &calls).await;
        let _ = fail(&b, &key, &calls).await;
        assert_eq!(b.state(&key), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let b = breakers();
        let a = CircuitKey::new("webhook", "https://a.example.com");
        let other = CircuitKey::new("webhook", "https://b.example.com");
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &a, &calls).await;
        }
        assert_eq!(b.state(&a), CircuitState::Open);
        assert_eq!(b.state(&other), CircuitState::Closed);
    }
}
