use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding store writes.
pub type WriteBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for store writes to stop hammering an unhealthy store.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, writes pass through.
/// - **OPEN**: Too many failures, writes fail fast with `WriteFailure::CircuitOpen`.
/// - **HALF_OPEN**: Testing if the store recovered.
pub fn create_write_circuit_breaker() -> WriteBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Reconnect delays for the live feed: exponential between `initial` and `max`,
/// at whole-second resolution.
///
/// The iterator never ends; callers create a fresh one after a healthy connection.
pub fn reconnect_backoff(initial: Duration, max: Duration) -> Exponential {
    backoff::exponential(initial, max)
}
