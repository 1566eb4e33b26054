use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Default number of kernel queues (queue 0 plus the waiter pool)
const QUEUES_DEFAULT: u16 = 4;
/// Default seconds between idleness sweeps
const SWEEP_INTERVAL_DEFAULT: u64 = 30;
/// Default milliseconds between unit activation polls
const STARTUP_POLL_MS_DEFAULT: u64 = 500;
/// Default seconds a waiter holds a packet before giving up on activation
const STARTUP_TIMEOUT_DEFAULT: u64 = 30;

/// Engine knobs
#[derive(Clone, Debug, Parser)]
pub struct Opts {
    /// Number of kernel packet queues to bind; queue 0 triggers wake-ups,
    /// queues 1..N hold packets during container startup
    #[clap(long, default_value_t = QUEUES_DEFAULT)]
    pub queues: u16,
    /// Which chain interception rules are inserted into
    #[clap(long, value_enum, default_value_t = Chain::Prerouting)]
    pub chain: Chain,
    /// Seconds between idleness sweeps
    #[clap(long, default_value_t = SWEEP_INTERVAL_DEFAULT)]
    pub sweep_interval: u64,
    /// Consecutive zero-traffic sweeps required before a container is idled
    #[clap(long, default_value_t = 1)]
    pub idle_ticks: u32,
    /// Milliseconds between activation polls while a packet is held
    #[clap(long, default_value_t = STARTUP_POLL_MS_DEFAULT)]
    pub startup_poll_ms: u64,
    /// Seconds to hold a packet waiting for the unit before releasing anyway
    #[clap(long, default_value_t = STARTUP_TIMEOUT_DEFAULT)]
    pub startup_timeout: u64,
}

impl Opts {
    pub fn config(&self) -> Config {
        Config {
            queues: self.queues,
            chain: self.chain,
            sweep_interval: Duration::from_secs(self.sweep_interval),
            idle_ticks: self.idle_ticks.max(1),
            startup_poll: Duration::from_millis(self.startup_poll_ms),
            startup_timeout: Duration::from_secs(self.startup_timeout),
        }
    }
}

/// Resolved engine configuration, fixed for the process lifetime
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub queues: u16,
    pub chain: Chain,
    pub sweep_interval: Duration,
    pub idle_ticks: u32,
    pub startup_poll: Duration,
    pub startup_timeout: Duration,
}

/// Where interception rules live
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Chain {
    /// nat PREROUTING, ahead of the DNAT that docker installs
    Prerouting,
    /// filter INPUT, for ports served from the host namespace
    Input,
}

impl Chain {
    pub fn table(&self) -> &'static str {
        match self {
            Chain::Prerouting => "nat",
            Chain::Input => "filter",
        }
    }
    pub fn chain(&self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_match_tables() {
        assert_eq!(Chain::Prerouting.table(), "nat");
        assert_eq!(Chain::Prerouting.chain(), "PREROUTING");
        assert_eq!(Chain::Input.table(), "filter");
        assert_eq!(Chain::Input.chain(), "INPUT");
    }

    #[test]
    fn idle_ticks_never_zero() {
        let opts = Opts::parse_from(["drowse", "--idle-ticks", "0"]);
        assert_eq!(opts.config().idle_ticks, 1);
    }
}
