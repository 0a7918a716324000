use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use anyhow::{anyhow, Context};

use crate::store::DEFAULT_HISTORY_LIMIT;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,

    /// How many messages a freshly announced connection gets in `message-history`.
    pub history_limit: u32,
    /// Capacity of every connection's outbound queue.
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: "sqlite::memory:".to_owned(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            outbound_queue: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let ip = match lookup("HOST") {
            Some(host) => IpAddr::from_str(host.trim())
                .with_context(|| format!("HOST={host} is not an ip address"))?,
            None => defaults.bind_addr.ip(),
        };
        let port: u16 = parse_var(&lookup, "PORT")?.unwrap_or(defaults.bind_addr.port());
        let bind_addr = SocketAddr::new(ip, port);

        let outbound_queue = parse_var(&lookup, "OUTBOUND_QUEUE")?.unwrap_or(defaults.outbound_queue);
        if outbound_queue == 0 {
            return Err(anyhow!("OUTBOUND_QUEUE must be greater than zero"));
        }

        Ok(Self {
            bind_addr,
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            history_limit: parse_var(&lookup, "HISTORY_LIMIT")?.unwrap_or(defaults.history_limit),
            outbound_queue,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid {key}={raw}")))
        .transpose()
}
