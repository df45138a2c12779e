//! Device configuration.
//!
//! [`DeviceConfigInput`] mirrors the TOML surface with every field optional;
//! [`DeviceConfigInput::resolve`] applies defaults, clamps sizes and rejects
//! values that cannot work.
//!
//! ```toml
//! version = 1
//! queue_count = 4
//! min_queue_count = 1
//! inline_threshold = 256
//! mtu = 1500
//! rss_key = "6d5a56da255b0ec24167253d43a38fb0d0ca2bcbae7b30b477cb2da38030f20c6a42b73bbeac01fa"
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::rss::{DEFAULT_RSS_KEY, DEFAULT_TABLE_SIZE, RSS_KEY_LEN};
use crate::rx::RxRingConfig;
use crate::tx::TxRingConfig;

pub const CONFIG_VERSION: u32 = 1;

pub const MAX_QUEUES: u16 = 64;
pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 65521;
/// Largest inline message: one send-buffer section.
pub const MAX_INLINE_THRESHOLD: usize = 6144;
pub const MIN_RECV_REGION: usize = 64 * 1024;
pub const MAX_RSS_TABLE_SIZE: usize = 4096;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfigInput {
    pub version: u32,
    pub queue_count: Option<u16>,
    pub min_queue_count: Option<u16>,
    pub inline_threshold: Option<usize>,
    pub mtu: Option<u32>,
    pub pool_size: Option<usize>,
    pub backlog_capacity: Option<usize>,
    pub recv_region_size: Option<usize>,
    /// 40-byte Toeplitz key as 80 hex digits.
    pub rss_key: Option<String>,
    pub rss_table_size: Option<usize>,
    pub hash_enabled: Option<bool>,
    pub drain_timeout_ms: Option<u64>,
    pub rx_ack_batch: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub version: u32,
    /// Queues requested at attach. The remote may grant fewer.
    pub queue_count: u16,
    /// Attach fails if fewer queues than this are granted.
    pub min_queue_count: u16,
    pub inline_threshold: usize,
    pub mtu: u32,
    /// Transmit descriptors per ring; also the channel queue depth.
    pub pool_size: usize,
    pub backlog_capacity: usize,
    pub recv_region_size: usize,
    pub rss_key: [u8; RSS_KEY_LEN],
    pub rss_table_size: usize,
    pub hash_enabled: bool,
    pub drain_timeout: Duration,
    pub rx_ack_batch: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            version: CONFIG_VERSION,
            queue_count: 1,
            min_queue_count: 1,
            inline_threshold: 256,
            mtu: 1500,
            pool_size: 512,
            backlog_capacity: 1024,
            recv_region_size: 2 * 1024 * 1024,
            rss_key: DEFAULT_RSS_KEY,
            rss_table_size: DEFAULT_TABLE_SIZE,
            hash_enabled: true,
            drain_timeout: Duration::from_millis(2000),
            rx_ack_batch: 64,
        }
    }
}

impl DeviceConfigInput {
    pub fn resolve(self) -> Result<DeviceConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }
        let defaults = DeviceConfig::default();

        let queue_count = self
            .queue_count
            .unwrap_or(defaults.queue_count)
            .clamp(1, MAX_QUEUES);
        let min_queue_count = self
            .min_queue_count
            .unwrap_or(defaults.min_queue_count)
            .clamp(1, queue_count);

        let mtu = self.mtu.unwrap_or(defaults.mtu);
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(format!("MTU {} outside {}..={}", mtu, MIN_MTU, MAX_MTU));
        }

        let rss_key = match self.rss_key {
            Some(hex) => parse_key(hex.trim())?,
            None => defaults.rss_key,
        };

        let rss_table_size = self.rss_table_size.unwrap_or(defaults.rss_table_size);
        if !rss_table_size.is_power_of_two() || rss_table_size > MAX_RSS_TABLE_SIZE {
            return Err(format!(
                "rss_table_size {} must be a power of two up to {}",
                rss_table_size, MAX_RSS_TABLE_SIZE
            ));
        }

        Ok(DeviceConfig {
            version,
            queue_count,
            min_queue_count,
            inline_threshold: self
                .inline_threshold
                .unwrap_or(defaults.inline_threshold)
                .min(MAX_INLINE_THRESHOLD),
            mtu,
            pool_size: self.pool_size.unwrap_or(defaults.pool_size).max(1),
            backlog_capacity: self
                .backlog_capacity
                .unwrap_or(defaults.backlog_capacity)
                .max(1),
            recv_region_size: self
                .recv_region_size
                .unwrap_or(defaults.recv_region_size)
                .max(MIN_RECV_REGION),
            rss_key,
            rss_table_size,
            hash_enabled: self.hash_enabled.unwrap_or(defaults.hash_enabled),
            drain_timeout: Duration::from_millis(
                self.drain_timeout_ms
                    .unwrap_or(defaults.drain_timeout.as_millis() as u64)
                    .max(1),
            ),
            rx_ack_batch: self.rx_ack_batch.unwrap_or(defaults.rx_ack_batch).max(1),
        })
    }
}

impl DeviceConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(DeviceConfig::default());
        }
        let parsed: DeviceConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    /// Check a config built in code rather than through `resolve`.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_QUEUES).contains(&self.queue_count) {
            return Err(format!("queue_count {} outside 1..={}", self.queue_count, MAX_QUEUES));
        }
        if self.min_queue_count == 0 || self.min_queue_count > self.queue_count {
            return Err(format!(
                "min_queue_count {} outside 1..={}",
                self.min_queue_count, self.queue_count
            ));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(format!("MTU {} outside {}..={}", self.mtu, MIN_MTU, MAX_MTU));
        }
        if self.inline_threshold > MAX_INLINE_THRESHOLD {
            return Err(format!("inline_threshold {} above {}", self.inline_threshold, MAX_INLINE_THRESHOLD));
        }
        if self.pool_size == 0 || self.backlog_capacity == 0 || self.rx_ack_batch == 0 {
            return Err("pool_size, backlog_capacity and rx_ack_batch must be non-zero".into());
        }
        if self.recv_region_size < MIN_RECV_REGION {
            return Err(format!("recv_region_size below {}", MIN_RECV_REGION));
        }
        if !self.rss_table_size.is_power_of_two() || self.rss_table_size > MAX_RSS_TABLE_SIZE {
            return Err(format!("rss_table_size {} invalid", self.rss_table_size));
        }
        Ok(())
    }

    pub fn with_queue_count(mut self, queue_count: u16) -> Self {
        self.queue_count = queue_count;
        self.min_queue_count = self.min_queue_count.min(queue_count.max(1));
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn tx_ring_config(&self) -> TxRingConfig {
        TxRingConfig {
            pool_size: self.pool_size,
            backlog_capacity: self.backlog_capacity,
            inline_threshold: self.inline_threshold,
            hash_enabled: self.hash_enabled,
        }
    }

    pub fn rx_ring_config(&self) -> RxRingConfig {
        RxRingConfig {
            mtu: self.mtu,
            ack_batch: self.rx_ack_batch,
        }
    }
}

fn parse_key(hex: &str) -> Result<[u8; RSS_KEY_LEN], String> {
    if hex.len() != RSS_KEY_LEN * 2 || !hex.is_ascii() {
        return Err(format!("rss_key must be {} hex digits", RSS_KEY_LEN * 2));
    }
    let mut key = [0u8; RSS_KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|e| format!("rss_key: {}", e))?;
    }
    Ok(key)
}
