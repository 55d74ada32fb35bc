// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Application configuration tree
//!
//! The configuration lives under an `atapp:` root in one or more YAML
//! documents. Files listed under `atapp.config.external` are merged in
//! after their parent, transitively. See [loader] for the merge rules.
//!
//! Identity fields behave specially across reloads: once `name`,
//! `hostname` or `identity` are set they are frozen and later values are
//! ignored (the prior value wins silently).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::Metadata;

pub mod loader;
pub mod scalars;

/// The default tick interval (16ms); ticks can never run faster than 1ms.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(16);
/// Minimum tick interval the timer accepts.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);
/// The default stop timeout before shutdown is forced.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// The default expiry for buffered outgoing messages.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

fn default_tick_interval() -> Duration {
    DEFAULT_TICK_INTERVAL
}
fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}
fn default_message_timeout() -> Duration {
    DEFAULT_MESSAGE_TIMEOUT
}
fn default_loop_times() -> i32 {
    128
}
fn default_log_level() -> String {
    "info".to_string()
}

/// One advertised ingress gateway, together with the constraints deciding
/// which peers are allowed to dial it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// The dialable address, `scheme://host[:port][/path]`
    #[serde(default)]
    pub address: String,
    /// If any entry is non-empty, a peer's hostname must match one entry
    #[serde(default)]
    pub match_hosts: Vec<String>,
    /// If any entry is non-empty, a peer's namespace must match one entry
    #[serde(default)]
    pub match_namespaces: Vec<String>,
    /// Every non-empty key/value pair must be present in a peer's labels
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Transport binding and backpressure knobs (`atapp.bus.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Addresses this node listens on
    pub listen: Vec<String>,
    /// Optional upstream proxy address
    pub proxy: String,
    /// Subnet declarations (`id/prefix`), advisory
    pub subnets: Vec<String>,
    /// Max buffered messages per endpoint; `0` means unbounded
    pub send_buffer_number: u64,
    /// Max buffered bytes per endpoint; `0` means unbounded
    pub send_buffer_size: u64,
    /// Per-wake drain budget for one endpoint retry pass
    pub loop_times: i32,
    /// Shared secrets for the bus handshake; empty disables authentication
    pub access_tokens: Vec<String>,
    /// Ingress points advertised to remote peers through discovery
    pub gateways: Vec<GatewayConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            proxy: String::new(),
            subnets: Vec::new(),
            send_buffer_number: 0,
            send_buffer_size: 0,
            loop_times: default_loop_times(),
            access_tokens: Vec::new(),
            gateways: Vec::new(),
        }
    }
}

/// Timer settings (`atapp.timer.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tick period; clamped to [MIN_TICK_INTERVAL]
    #[serde(with = "scalars::duration_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Grace period for cooperative shutdown before modules are forced
    #[serde(with = "scalars::duration_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
    /// Expiry for buffered outgoing messages
    #[serde(with = "scalars::duration_serde", default = "default_message_timeout")]
    pub message_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
        }
    }
}

impl TimerConfig {
    /// The effective tick interval after clamping.
    pub fn effective_tick_interval(&self) -> Duration {
        if self.tick_interval < MIN_TICK_INTERVAL {
            DEFAULT_TICK_INTERVAL
        } else {
            self.tick_interval
        }
    }
}

/// Log settings (`atapp.log.*`). The heavy lifting (categories, rotating
/// sinks) belongs to the embedding application; the framework only drives
/// the tracing filter level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A `tracing_subscriber::EnvFilter` directive, e.g. `info` or
    /// `atapp=debug,info`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Optional area/topology metadata (`atapp.area.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    /// Region name
    pub region: String,
    /// Numeric zone id
    pub zone_id: u64,
    /// District name
    pub district: String,
}

/// Nested include list (`atapp.config.external`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigIncludes {
    /// Further configuration files, loaded after their parent
    pub external: Vec<String>,
}

/// The `atapp:` configuration root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Node id, plain or dotted form (see [crate::identity])
    pub id: String,
    /// Dotted bit-width mask interpreting dotted ids
    pub id_mask: String,
    /// Node name; defaults to `<type_name>-0x<id:hex>`, frozen after set
    pub name: String,
    /// Numeric node type
    pub type_id: u64,
    /// Human-readable node type
    pub type_name: String,
    /// Host name; defaults to the local hostname, frozen after set
    pub hostname: String,
    /// Identity digest; computed on first init, frozen after set
    pub identity: String,
    /// Optional area metadata
    pub area: AreaConfig,
    /// Gateway-matching inputs (labels and namespace)
    pub metadata: Metadata,
    /// Transport binding and backpressure
    pub bus: BusConfig,
    /// Tick, stop and message timers
    pub timer: TimerConfig,
    /// Log filter settings
    pub log: LogConfig,
    /// Remove the pid file on graceful exit
    pub remove_pidfile_after_exit: bool,
    /// Include list
    pub config: ConfigIncludes,
}
