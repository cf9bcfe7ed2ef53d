use std::env;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen: SocketAddr,
    /// An upstream with no ping inside this window is swept.
    pub upstream_timeout: Duration,
    pub sweep_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".parse().expect("static address"),
            upstream_timeout: Duration::from_secs(60),
            sweep_period: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: parse_var("PORTHOLE_RELAY_LISTEN", defaults.listen),
            upstream_timeout: Duration::from_secs(parse_var(
                "PORTHOLE_RELAY_UPSTREAM_TIMEOUT",
                defaults.upstream_timeout.as_secs(),
            )),
            sweep_period: Duration::from_secs(parse_var(
                "PORTHOLE_RELAY_SWEEP_PERIOD",
                defaults.sweep_period.as_secs(),
            )),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
