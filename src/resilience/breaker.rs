//! Circuit breaker, one instance per downstream dependency
//!
//! `Closed` counts consecutive failures and trips to `Open` at `max_failures`.
//! `Open` rejects every call until `reset_timeout` has elapsed, then the next
//! caller moves it to `HalfOpen`, where at most `max_half_open_calls` probes run
//! at once. A probe failure reopens the breaker; `half_open_successes` probe
//! successes close it.
//!
//! Every transition bumps a generation counter. Outcomes reported by permits
//! from an earlier generation are ignored, so a slow call that started before a
//! trip can't close or reopen the breaker later.

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub max_failures: u32,
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Probes admitted concurrently while half-open
    pub max_half_open_calls: u32,
    /// Probe successes needed to close again; `max_half_open_calls` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_successes: Option<u32>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
            max_half_open_calls: 1,
            half_open_successes: None,
        }
    }
}

impl BreakerConfig {
    pub fn required_successes(&self) -> u32 {
        self.half_open_successes
            .unwrap_or(self.max_half_open_calls)
            .max(1)
    }
}

/// Called with `(breaker name, from, to)` after every transition
pub type StateChangeCallback = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Why a call was not let through
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerRejection {
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    #[error("circuit breaker '{0}' is half-open and all probe slots are taken")]
    ProbeLimit(String),
}

impl BreakerRejection {
    pub fn breaker(&self) -> &str {
        match self {
            BreakerRejection::Open(name) | BreakerRejection::ProbeLimit(name) => name,
        }
    }
}

/// Result of [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The wrapped function was not invoked
    #[error(transparent)]
    Rejected(BreakerRejection),

    /// The wrapped function ran and failed
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    in_flight: u32,
    successes: u32,
    generation: u64,
}

type Transition = Option<(BreakerState, BreakerState)>;

impl Inner {
    fn transition(&mut self, to: BreakerState) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.in_flight = 0;
        self.successes = 0;
        match to {
            BreakerState::Open => self.opened_at = Some(Instant::now()),
            BreakerState::Closed => {
                self.failures = 0;
                self.opened_at = None;
            }
            BreakerState::HalfOpen => {}
        }
        (from != to).then_some((from, to))
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                in_flight: 0,
                successes: 0,
                generation: 0,
            }),
            on_state_change: None,
        }
    }

    pub fn with_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state; an `Open` breaker past its reset timeout still reads
    /// `Open` until the next caller moves it to `HalfOpen`
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().failures
    }

    /// Ask to run one call through the breaker.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]; dropping it unresolved records nothing and
    /// frees its probe slot.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, BreakerRejection> {
        let mut inner = self.lock();
        let mut transition = None;

        if inner.state == BreakerState::Open {
            let cooled_down = inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
            if !cooled_down {
                return Err(BreakerRejection::Open(self.name.clone()));
            }
            transition = inner.transition(BreakerState::HalfOpen);
        }

        let probe = inner.state == BreakerState::HalfOpen;
        let admitted = if probe {
            if inner.in_flight < self.config.max_half_open_calls.max(1) {
                inner.in_flight += 1;
                Ok(BreakerPermit {
                    breaker: self,
                    probe: true,
                    generation: inner.generation,
                    resolved: false,
                })
            } else {
                Err(BreakerRejection::ProbeLimit(self.name.clone()))
            }
        } else {
            Ok(BreakerPermit {
                breaker: self,
                probe: false,
                generation: inner.generation,
                resolved: false,
            })
        };

        drop(inner);
        self.notify(transition);
        admitted
    }

    /// Run `op` through the breaker; any `Err` counts as a failure
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(BreakerError::Rejected)?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn record(&self, generation: u64, probe: bool, succeeded: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        let transition = match (inner.state, succeeded) {
            (BreakerState::Closed, true) => {
                inner.failures = 0;
                None
            }
            (BreakerState::Closed, false) => {
                inner.failures += 1;
                if inner.failures >= self.config.max_failures.max(1) {
                    inner.transition(BreakerState::Open)
                } else {
                    None
                }
            }
            (BreakerState::HalfOpen, true) if probe => {
                inner.in_flight = inner.in_flight.saturating_sub(1);
                inner.successes += 1;
                if inner.successes >= self.config.required_successes() {
                    inner.transition(BreakerState::Closed)
                } else {
                    None
                }
            }
            (BreakerState::HalfOpen, false) if probe => inner.transition(BreakerState::Open),
            _ => None,
        };

        drop(inner);
        self.notify(transition);
    }

    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == BreakerState::HalfOpen {
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
    }

    fn notify(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            BreakerState::Open => {
                tracing::warn!(breaker = %self.name, %from, "🚨 Circuit breaker opened")
            }
            BreakerState::HalfOpen => {
                tracing::info!(breaker = %self.name, "🔁 Circuit breaker half-open, probing")
            }
            BreakerState::Closed => {
                tracing::info!(breaker = %self.name, "✅ Circuit breaker closed")
            }
        }
        if let Some(callback) = &self.on_state_change {
            callback(&self.name, from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish_non_exhaustive()
    }
}

/// Admission for one call, see [`CircuitBreaker::acquire`]
#[must_use = "resolve the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record(self.generation, self.probe, true);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record(self.generation, self.probe, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release(self.generation);
        }
    }
}

/// Breakers keyed by dependency name, created on first use
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    on_state_change: Option<StateChangeCallback>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            on_state_change: None,
        }
    }

    /// Use `config` instead of the defaults for the breaker named `name`
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Callback installed on every breaker this registry creates
    pub fn with_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Shared breaker for `name`
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self.overrides.get(name).unwrap_or(&self.defaults).clone();
            let mut breaker = CircuitBreaker::new(name, config);
            if let Some(callback) = &self.on_state_change {
                breaker = breaker.with_callback(Arc::clone(callback));
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Names and states of every breaker created so far, sorted by name
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("states", &self.states())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_half_open_calls: u32) -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_secs(10),
            max_half_open_calls,
            half_open_successes: Some(1),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_consecutive_failures_and_fails_fast() {
        let breaker = CircuitBreaker::new("db", config(1));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(BreakerError::Rejected(BreakerRejection::Open(ref name))) if name == "db"
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("db", config(1));
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_the_configured_number_of_probes() {
        let breaker = CircuitBreaker::new("api", config(2));
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(breaker.acquire(), Err(BreakerRejection::Open(_))));

        tokio::time::advance(Duration::from_secs(1)).await;
        let first = breaker.acquire().unwrap();
        let second = breaker.acquire().unwrap();
        assert!(first.is_probe() && second.is_probe());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(matches!(breaker.acquire(), Err(BreakerRejection::ProbeLimit(_))));

        // An abandoned probe frees its slot
        drop(second);
        let third = breaker.acquire().unwrap();

        first.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        // Outcome from the superseded half-open generation is ignored
        third.failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_restarts_the_cooldown() {
        let breaker = CircuitBreaker::new("api", config(1));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(breaker.acquire(), Err(BreakerRejection::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = BreakerRegistry::new(config(1)).with_callback(Arc::new(
            move |name: &str, from: BreakerState, to: BreakerState| {
                sink.lock().unwrap().push((name.to_string(), from, to));
            },
        ));

        let breaker = registry.get("mail");
        assert!(Arc::ptr_eq(&breaker, &registry.get("mail")));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("mail".to_string(), BreakerState::Closed, BreakerState::Open),
                ("mail".to_string(), BreakerState::Open, BreakerState::HalfOpen),
                ("mail".to_string(), BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
        assert_eq!(registry.states(), vec![("mail".to_string(), BreakerState::Closed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn omitted_success_quota_follows_half_open_calls() {
        let config: BreakerConfig =
            serde_json::from_str(r#"{"max_failures": 1, "reset_timeout_ms": 1000, "max_half_open_calls": 3}"#).unwrap();
        assert_eq!(config.half_open_successes, None);
        assert_eq!(config.required_successes(), 3);

        let breaker = CircuitBreaker::new("ledger", config);
        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let permits = [breaker.acquire().unwrap(), breaker.acquire().unwrap(), breaker.acquire().unwrap()];
        for (done, permit) in permits.into_iter().enumerate() {
            assert_eq!(breaker.state(), BreakerState::HalfOpen, "after {done} successes");
            permit.success();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        let explicit = BreakerConfig {
            max_half_open_calls: 3,
            half_open_successes: Some(2),
            ..BreakerConfig::default()
        };
        assert_eq!(explicit.required_successes(), 2);
    }

    #[test]
    fn overrides_apply_per_name() {
        let registry = BreakerRegistry::default().with_override("slow", config(4));
        assert_eq!(registry.get("slow").config().max_half_open_calls, 4);
        assert_eq!(registry.get("other").config(), &BreakerConfig::default());
    }
}
