#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use crate::auth::AuthConfig;
use crate::monitor::DEFAULT_DISRUPTION_WINDOW;
use crate::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};

/// How long the handshake waits for a `connection_ack` frame.
pub const DEFAULT_CONNECTION_INIT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a subscription start waits for its `start_ack` frame.
pub const DEFAULT_START_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Keepalive timeout used until the gateway advertises its own interval.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Early-warning timer; firing signals a missed keepalive without
/// closing the socket.
pub const DEFAULT_KEEP_ALIVE_ALERT_TIMEOUT: Duration = Duration::from_secs(65);

/// Idle period after the last unsubscribe before the socket is closed,
/// absorbing rapid unsubscribe/resubscribe cycles.
pub const DEFAULT_CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Gateway error codes that must not be retried during the handshake.
pub(crate) static NON_RETRYABLE_CODES: phf::Set<u16> = phf::phf_set! {
    400_u16,
    401_u16,
    403_u16,
};

/// Configuration for the realtime subscription client.
#[non_exhaustive]
#[derive(Clone, Debug, bon::Builder)]
pub struct Config {
    /// HTTPS GraphQL endpoint of the gateway
    #[builder(into)]
    pub endpoint: String,
    /// Default authentication for handshakes and subscription starts
    #[builder(default)]
    pub auth: AuthConfig,
    /// Handshake `connection_ack` timeout
    #[builder(default = DEFAULT_CONNECTION_INIT_TIMEOUT)]
    pub connection_init_timeout: Duration,
    /// Per-subscription `start_ack` timeout
    #[builder(default = DEFAULT_START_ACK_TIMEOUT)]
    pub start_ack_timeout: Duration,
    /// Keepalive timeout before the gateway advertises its interval
    #[builder(default = DEFAULT_KEEP_ALIVE_TIMEOUT)]
    pub keep_alive_timeout: Duration,
    /// Missed-keepalive early warning
    #[builder(default = DEFAULT_KEEP_ALIVE_ALERT_TIMEOUT)]
    pub keep_alive_alert_timeout: Duration,
    /// Idle grace before closing a subscription-less socket
    #[builder(default = DEFAULT_CLOSE_GRACE_PERIOD)]
    pub close_grace_period: Duration,
    /// Unrecovered missed-keepalive window before the connection counts
    /// as disrupted
    #[builder(default = DEFAULT_DISRUPTION_WINDOW)]
    pub disruption_window: Duration,
    /// Handshake retry behavior
    #[builder(default)]
    pub retry: RetryConfig,
    /// Connect with `ws://` instead of `wss://`. Only for tests against
    /// local plaintext gateways.
    #[builder(default = false)]
    pub dangerously_connect_insecurely: bool,
}

/// Handshake retry configuration.
#[non_exhaustive]
#[derive(Clone, Debug, bon::Builder)]
pub struct RetryConfig {
    /// Attempt cap; the delay policy usually stops retrying first
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Ceiling for the jittered exponential delay between attempts
    #[builder(default = DEFAULT_MAX_DELAY)]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_gateway_constants() {
        let config = Config::builder().endpoint("https://example.com/graphql").build();

        assert_eq!(config.connection_init_timeout, Duration::from_secs(15));
        assert_eq!(config.start_ack_timeout, Duration::from_secs(15));
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(300));
        assert_eq!(config.keep_alive_alert_timeout, Duration::from_secs(65));
        assert_eq!(config.close_grace_period, Duration::from_secs(1));
        assert!(!config.dangerously_connect_insecurely);
    }

    #[test]
    fn builder_overrides_timeouts() {
        let config = Config::builder()
            .endpoint("https://example.com/graphql")
            .start_ack_timeout(Duration::from_millis(200))
            .retry(RetryConfig::builder().max_attempts(2).build())
            .build();

        assert_eq!(config.start_ack_timeout, Duration::from_millis(200));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay, DEFAULT_MAX_DELAY, "unset fields keep defaults");
    }

    #[test]
    fn client_rejection_codes_are_not_retryable() {
        for code in [400_u16, 401, 403] {
            assert!(NON_RETRYABLE_CODES.contains(&code), "{code} must not be retried");
        }
        assert!(!NON_RETRYABLE_CODES.contains(&500_u16), "server faults stay retryable");
    }
}
