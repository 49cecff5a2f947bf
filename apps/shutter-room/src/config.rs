use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;

const DEFAULT_PARTICIPANT_MAX: usize = 4;
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(20);
const DEFAULT_LEASE_MAX_TTL: Duration = Duration::from_secs(120);
const MIN_LEASE_TTL: Duration = Duration::from_secs(1);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_CONNECTION_BUFFER: usize = 64;

/// Limits and timings of the room core.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub participant_max: usize,
    pub lease_ttl: Duration,
    pub lease_max_ttl: Duration,
    pub sweep_interval: Duration,
    pub connection_buffer: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            participant_max: DEFAULT_PARTICIPANT_MAX,
            lease_ttl: DEFAULT_LEASE_TTL,
            lease_max_ttl: DEFAULT_LEASE_MAX_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            connection_buffer: DEFAULT_CONNECTION_BUFFER,
        }
    }
}

impl RoomConfig {
    /// TTL for a client lease request: the default when absent, otherwise
    /// clamped to `[1s, lease_max_ttl]`.
    pub fn lease_ttl_for(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            None => self.lease_ttl,
            Some(ms) => Duration::from_millis(ms)
                .clamp(MIN_LEASE_TTL, self.lease_max_ttl.max(MIN_LEASE_TTL)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub room: RoomConfig,
    pub trust_account_header: bool,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "shutter-room",
    author,
    version,
    about = "Room coordination server for multi-device camera control"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "SHUTTER_ROOM_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Participant slots per room.
    #[arg(long, env = "SHUTTER_ROOM_PARTICIPANT_MAX", default_value_t = DEFAULT_PARTICIPANT_MAX)]
    pub participant_max: usize,

    /// Lease TTL used when a client does not ask for one.
    #[arg(long, env = "SHUTTER_ROOM_LEASE_TTL_SECS", default_value_t = 20)]
    pub lease_ttl_secs: u64,

    /// Upper bound for client-requested lease TTLs.
    #[arg(long, env = "SHUTTER_ROOM_LEASE_MAX_TTL_SECS", default_value_t = 120)]
    pub lease_max_ttl_secs: u64,

    /// How often expired leases are swept.
    #[arg(long, env = "SHUTTER_ROOM_SWEEP_INTERVAL_MS", default_value_t = 2000)]
    pub sweep_interval_ms: u64,

    /// Outbound frames buffered per connection before it counts as dead.
    #[arg(
        long,
        env = "SHUTTER_ROOM_CONNECTION_BUFFER",
        default_value_t = DEFAULT_CONNECTION_BUFFER
    )]
    pub connection_buffer: usize,

    /// Require an `x-account-id` header from an authenticating proxy and bind
    /// connections to that account's room.
    #[arg(long, env = "SHUTTER_ROOM_TRUST_ACCOUNT_HEADER", default_value_t = false)]
    pub trust_account_header: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SHUTTER_ROOM_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let room = RoomConfig {
            participant_max: cli.participant_max,
            lease_ttl: Duration::from_secs(cli.lease_ttl_secs),
            lease_max_ttl: Duration::from_secs(cli.lease_max_ttl_secs),
            sweep_interval: Duration::from_millis(cli.sweep_interval_ms),
            connection_buffer: cli.connection_buffer,
        };
        ensure!(room.participant_max >= 1, "participant max must be at least 1");
        ensure!(room.lease_ttl >= MIN_LEASE_TTL, "lease ttl must be at least 1s");
        ensure!(
            room.lease_max_ttl >= room.lease_ttl,
            "lease max ttl must not be below the default ttl"
        );
        ensure!(
            room.sweep_interval >= MIN_SWEEP_INTERVAL,
            "sweep interval must be at least {}ms",
            MIN_SWEEP_INTERVAL.as_millis()
        );
        ensure!(room.connection_buffer >= 1, "connection buffer must be at least 1");

        Ok(ServerConfig {
            listen_addr,
            room,
            trust_account_header: cli.trust_account_header,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
