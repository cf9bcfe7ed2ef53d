use std::env;
use std::net::SocketAddr;

/// Environment-driven defaults; CLI flags override these per invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen: SocketAddr,
    pub cols: u16,
    pub rows: u16,
    pub max_cols: u16,
    pub max_rows: u16,
    pub frame_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7070".parse().expect("static address"),
            cols: 80,
            rows: 24,
            max_cols: 500,
            max_rows: 200,
            frame_rate: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: parse_var("PORTHOLE_LISTEN", defaults.listen),
            cols: parse_var("PORTHOLE_COLS", defaults.cols),
            rows: parse_var("PORTHOLE_ROWS", defaults.rows),
            max_cols: parse_var("PORTHOLE_MAX_COLS", defaults.max_cols),
            max_rows: parse_var("PORTHOLE_MAX_ROWS", defaults.max_rows),
            frame_rate: parse_var("PORTHOLE_FRAME_RATE", defaults.frame_rate),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment-variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.cols, 80);
    }

    #[test]
    fn env_overrides_frame_rate() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("PORTHOLE_FRAME_RATE", "60");
        }
        let config = Config::from_env();
        assert_eq!(config.frame_rate, 60);
        unsafe {
            env::remove_var("PORTHOLE_FRAME_RATE");
        }
    }

    #[test]
    fn malformed_env_falls_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("PORTHOLE_COLS", "not-a-number");
        }
        let config = Config::from_env();
        assert_eq!(config.cols, 80);
        unsafe {
            env::remove_var("PORTHOLE_COLS");
        }
    }
}
