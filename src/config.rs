use std::{net::SocketAddr, str::FromStr, time::Duration};

use crate::error::ConfigErr;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_ORIGINS: &str = "https://listening-rooms-client.onrender.com,http://localhost:8080";
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// Runtime settings, read from the environment (and `.env`) at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port:            u16,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    /// Per-room chat cap; `None` keeps everything.
    pub history_limit:   Option<usize>,
    pub outbound_queue:  usize,
    pub send_timeout:    Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigErr> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigErr> {
        let origins = get("ALLOWED_ORIGINS").unwrap_or_else(|| DEFAULT_ORIGINS.into());
        let allowed_origins = if origins.trim() == "*" {
            Vec::new()
        } else {
            origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect()
        };

        let history_limit = match get("CHAT_HISTORY_LIMIT") {
            Some(v) => Some(positive("CHAT_HISTORY_LIMIT", &v)?),
            None => None,
        };
        let outbound_queue = match get("OUTBOUND_QUEUE") {
            Some(v) => positive("OUTBOUND_QUEUE", &v)?,
            None => DEFAULT_OUTBOUND_QUEUE,
        };
        let send_timeout_ms = match get("SEND_TIMEOUT_MS") {
            Some(v) => positive::<u64>("SEND_TIMEOUT_MS", &v)?,
            None => DEFAULT_SEND_TIMEOUT_MS,
        };
        let port = match get("PORT") {
            Some(v) => parse("PORT", &v)?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            port,
            allowed_origins,
            history_limit,
            outbound_queue,
            send_timeout: Duration::from_millis(send_timeout_ms),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Requests without an `Origin` header (non-browser clients) pass.
    /// Scheme and trailing slash are ignored, so `localhost:8080` matches
    /// `http://localhost:8080`.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else { return true };
        if self.allowed_origins.is_empty() {
            return true;
        }
        let want = bare(origin);
        self.allowed_origins.iter().any(|o| bare(o).eq_ignore_ascii_case(want))
    }
}

fn bare(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, r)| r);
    rest.trim_end_matches('/')
}

fn parse<T: FromStr>(key: &'static str, v: &str) -> Result<T, ConfigErr> {
    v.trim()
        .parse()
        .map_err(|_| ConfigErr::Invalid { key, value: v.to_owned() })
}

fn positive<T: FromStr + Default + PartialOrd>(key: &'static str, v: &str) -> Result<T, ConfigErr> {
    let n: T = parse(key, v)?;
    if n > T::default() {
        Ok(n)
    } else {
        Err(ConfigErr::Invalid { key, value: v.to_owned() })
    }
}
