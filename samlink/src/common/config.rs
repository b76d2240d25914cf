// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-tunnel parameters and their serialization into bridge option fragments

use std::sync::OnceLock;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
  destination::{DestinationKeys, SignatureType},
  protocol::{session::SessionStyle, SamVersion},
};

pub const DEFAULT_SAM_HOST: &str = "127.0.0.1";
pub const DEFAULT_SAM_PORT: u16 = 7656;
pub const SAM_HOST_ENV: &str = "sam_host";
pub const SAM_PORT_ENV: &str = "sam_port";

const TUNNEL_NAME_LENGTH: usize = 12;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("Invalid bridge address {0:?}")]
  InvalidAddress(String),
  #[error("Invalid bridge port {0:?}; must be a number in 0-65535")]
  InvalidPort(String),
  #[error("Invalid protocol version {0:?}")]
  InvalidVersion(String),
  #[error("{field} must be within {min}..={max}, got {value}")]
  OutOfRange {
    field: &'static str,
    min: i64,
    max: i64,
    value: i64,
  },
  #[error("Invalid session style {0:?}; must be STREAM, DATAGRAM, RAW or PRIMARY")]
  InvalidStyle(String),
  #[error("Invalid message reliability {0:?}; must be none, BestEffort or Guaranteed")]
  InvalidReliability(String),
  #[error("Invalid access list type {0:?}; must be whitelist, blacklist or none")]
  InvalidAccessListType(String),
  #[error("Invalid lease set encryption type {0:?}")]
  InvalidLeaseSetEncryption(String),
  #[error("Unknown tunnel preset {0:?}")]
  InvalidPreset(String),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessListType {
  Whitelist,
  Blacklist,
  #[default]
  None,
}

/// Named tunnel shapes trading bandwidth and resilience against resource use
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelPreset {
  /// Very heavy traffic; wasteful when idle
  Humongous,
  Large,
  /// Heavy traffic over single-hop tunnels, with minimal anonymity
  Wide,
  Medium,
  /// Sensible for most uses
  Default,
  /// One tunnel each way; short-lived, small flows only
  Small,
  /// No anonymity for this side of the connection
  ZeroHop,
}

/// Per-direction shape of a preset
struct TunnelShape {
  length: u8,
  variance: i8,
  backups: u8,
  quantity: u8,
}

impl TunnelPreset {
  fn shape(self) -> TunnelShape {
    let (length, variance, backups, quantity) = match self {
      TunnelPreset::Humongous => (3, 1, 3, 6),
      TunnelPreset::Large => (3, 1, 1, 4),
      TunnelPreset::Wide => (1, 1, 2, 3),
      TunnelPreset::Medium => (3, 1, 0, 2),
      TunnelPreset::Default => (3, 0, 1, 1),
      TunnelPreset::Small => (3, 1, 0, 1),
      TunnelPreset::ZeroHop => (0, 0, 0, 2),
    };
    TunnelShape {
      length,
      variance,
      backups,
      quantity,
    }
  }
}

impl std::str::FromStr for TunnelPreset {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "humongous" => Ok(TunnelPreset::Humongous),
      "large" => Ok(TunnelPreset::Large),
      "wide" => Ok(TunnelPreset::Wide),
      "medium" => Ok(TunnelPreset::Medium),
      "default" => Ok(TunnelPreset::Default),
      "small" => Ok(TunnelPreset::Small),
      "zerohop" => Ok(TunnelPreset::ZeroHop),
      _ => Err(ConfigError::InvalidPreset(s.to_owned())),
    }
  }
}

/// Configuration for one tunnel and the bridge it is negotiated with
///
/// Sessions snapshot this value when they are established; mutating a
/// configuration afterwards has no effect on sessions already created from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamConfig {
  pub sam_host: String,
  pub sam_port: u16,
  pub sam_min: SamVersion,
  pub sam_max: SamVersion,
  tunnel_name: Option<String>,
  #[serde(skip)]
  generated_name: OnceLock<String>,
  pub style: SessionStyle,
  pub from_port: u16,
  pub to_port: u16,
  pub signature_type: Option<SignatureType>,
  #[serde(skip)]
  pub destination_keys: Option<DestinationKeys>,

  in_length: u8,
  out_length: u8,
  in_variance: i8,
  out_variance: i8,
  in_quantity: u8,
  out_quantity: u8,
  in_backup_quantity: u8,
  out_backup_quantity: u8,
  pub in_allow_zero_hop: bool,
  pub out_allow_zero_hop: bool,
  pub fast_receive: bool,
  pub use_compression: bool,
  message_reliability: String,
  close_idle: bool,
  close_idle_time_ms: u32,
  reduce_idle: bool,
  reduce_idle_time_s: u32,
  reduce_idle_quantity: u8,
  pub encrypt_lease_set: bool,
  pub lease_set_key: Option<String>,
  pub lease_set_private_key: Option<String>,
  pub lease_set_private_signing_key: Option<String>,
  lease_set_encryption: String,
  access_list_type: AccessListType,
  access_list: Vec<String>,
}

impl Default for SamConfig {
  fn default() -> Self {
    Self {
      sam_host: DEFAULT_SAM_HOST.to_owned(),
      sam_port: DEFAULT_SAM_PORT,
      sam_min: SamVersion::V3_0,
      sam_max: SamVersion::V3_1,
      tunnel_name: None,
      generated_name: OnceLock::new(),
      style: SessionStyle::Stream,
      from_port: 0,
      to_port: 0,
      signature_type: None,
      destination_keys: None,
      in_length: 3,
      out_length: 3,
      in_variance: 1,
      out_variance: 1,
      in_quantity: 2,
      out_quantity: 2,
      in_backup_quantity: 3,
      out_backup_quantity: 3,
      in_allow_zero_hop: false,
      out_allow_zero_hop: false,
      fast_receive: false,
      use_compression: true,
      message_reliability: "none".to_owned(),
      close_idle: false,
      close_idle_time_ms: 300_000,
      reduce_idle: false,
      reduce_idle_time_s: 15,
      reduce_idle_quantity: 4,
      encrypt_lease_set: false,
      lease_set_key: None,
      lease_set_private_key: None,
      lease_set_private_signing_key: None,
      lease_set_encryption: "4,0".to_owned(),
      access_list_type: AccessListType::None,
      access_list: Vec::new(),
    }
  }
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
  if (min..=max).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::OutOfRange {
      field,
      min,
      max,
      value,
    })
  }
}

fn random_tunnel_name() -> String {
  let mut rng = rand::thread_rng();
  let name: String = (0..TUNNEL_NAME_LENGTH)
    .map(|_| rng.gen_range(b'a'..=b'z') as char)
    .collect();
  tracing::debug!(tunnel_name = %name, "Generated random tunnel name");
  name
}

impl SamConfig {
  /// Defaults, with the bridge address overridden by `sam_host` / `sam_port` when set
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();
    if let Ok(host) = std::env::var(SAM_HOST_ENV) {
      config.set_sam_host(host);
    }
    if let Ok(port) = std::env::var(SAM_PORT_ENV) {
      config.set_sam_port_str(&port)?;
    }
    Ok(config)
  }

  /// Defaults with the tunnel lengths, variances, backups and quantities of `preset`
  pub fn with_preset(preset: TunnelPreset) -> Self {
    let mut config = Self::default();
    config.apply_preset(preset);
    config
  }

  /// Applies `preset` to both directions, leaving every other option untouched
  pub fn apply_preset(&mut self, preset: TunnelPreset) {
    let shape = preset.shape();
    self.in_length = shape.length;
    self.out_length = shape.length;
    self.in_variance = shape.variance;
    self.out_variance = shape.variance;
    self.in_backup_quantity = shape.backups;
    self.out_backup_quantity = shape.backups;
    self.in_quantity = shape.quantity;
    self.out_quantity = shape.quantity;
  }

  /// The bridge address as `host:port`
  pub fn sam_address(&self) -> String {
    if self.sam_host.contains(':') {
      format!("[{}]:{}", self.sam_host, self.sam_port)
    } else {
      format!("{}:{}", self.sam_host, self.sam_port)
    }
  }

  /// Sets host and port from `host[:port]`; a missing port keeps the default
  pub fn set_sam_address(&mut self, address: &str) -> Result<(), ConfigError> {
    let address = address.trim();
    if address.is_empty() {
      return Err(ConfigError::InvalidAddress(address.to_owned()));
    }
    if let Ok(socket) = address.parse::<std::net::SocketAddr>() {
      self.sam_host = socket.ip().to_string();
      self.sam_port = socket.port();
      return Ok(());
    }
    match address.rsplit_once(':') {
      Some((host, _)) if host.is_empty() || host.contains(':') => {
        Err(ConfigError::InvalidAddress(address.to_owned()))
      }
      Some((host, port)) => {
        self.set_sam_port_str(port)?;
        self.sam_host = host.to_owned();
        Ok(())
      }
      None => {
        self.sam_host = address.to_owned();
        self.sam_port = DEFAULT_SAM_PORT;
        Ok(())
      }
    }
  }

  pub fn set_sam_host<S: Into<String>>(&mut self, host: S) {
    self.sam_host = host.into();
  }

  pub fn set_sam_port_str(&mut self, port: &str) -> Result<(), ConfigError> {
    self.sam_port = port
      .trim()
      .parse::<u16>()
      .map_err(|_| ConfigError::InvalidPort(port.to_owned()))?;
    Ok(())
  }

  pub fn set_versions(&mut self, min: &str, max: &str) -> Result<(), ConfigError> {
    self.sam_min = min.parse()?;
    self.sam_max = max.parse()?;
    Ok(())
  }

  pub fn tunnel_name(&self) -> Option<&str> {
    self.tunnel_name.as_deref()
  }

  pub fn set_tunnel_name<S: Into<String>>(&mut self, name: S) {
    self.tunnel_name = Some(name.into());
    self.generated_name = OnceLock::new();
  }

  /// The tunnel id: the configured name, or 12 random lowercase letters chosen once
  pub fn id(&self) -> &str {
    match &self.tunnel_name {
      Some(name) if !name.is_empty() => name,
      _ => self.generated_name.get_or_init(random_tunnel_name),
    }
  }

  pub fn set_style_str(&mut self, style: &str) -> Result<(), ConfigError> {
    self.style = style.parse()?;
    Ok(())
  }

  pub fn set_in_length(&mut self, hops: u8) -> Result<(), ConfigError> {
    check_range("inbound.length", hops as i64, 0, 6)?;
    self.in_length = hops;
    Ok(())
  }

  pub fn set_out_length(&mut self, hops: u8) -> Result<(), ConfigError> {
    check_range("outbound.length", hops as i64, 0, 6)?;
    self.out_length = hops;
    Ok(())
  }

  pub fn set_in_variance(&mut self, variance: i8) -> Result<(), ConfigError> {
    check_range("inbound.lengthVariance", variance as i64, -6, 6)?;
    self.in_variance = variance;
    Ok(())
  }

  pub fn set_out_variance(&mut self, variance: i8) -> Result<(), ConfigError> {
    check_range("outbound.lengthVariance", variance as i64, -6, 6)?;
    self.out_variance = variance;
    Ok(())
  }

  pub fn set_in_quantity(&mut self, tunnels: u8) -> Result<(), ConfigError> {
    check_range("inbound.quantity", tunnels as i64, 1, 16)?;
    self.in_quantity = tunnels;
    Ok(())
  }

  pub fn set_out_quantity(&mut self, tunnels: u8) -> Result<(), ConfigError> {
    check_range("outbound.quantity", tunnels as i64, 1, 16)?;
    self.out_quantity = tunnels;
    Ok(())
  }

  pub fn set_in_backups(&mut self, tunnels: u8) -> Result<(), ConfigError> {
    check_range("inbound.backupQuantity", tunnels as i64, 0, 5)?;
    self.in_backup_quantity = tunnels;
    Ok(())
  }

  pub fn set_out_backups(&mut self, tunnels: u8) -> Result<(), ConfigError> {
    check_range("outbound.backupQuantity", tunnels as i64, 0, 5)?;
    self.out_backup_quantity = tunnels;
    Ok(())
  }

  pub fn set_message_reliability(&mut self, reliability: &str) -> Result<(), ConfigError> {
    match reliability {
      "none" | "BestEffort" | "Guaranteed" => {
        self.message_reliability = reliability.to_owned();
        Ok(())
      }
      other => Err(ConfigError::InvalidReliability(other.to_owned())),
    }
  }

  /// Enables reduce-on-idle after `seconds` of inactivity, keeping `quantity` tunnels
  pub fn set_reduce_idle(&mut self, seconds: u32, quantity: u8) -> Result<(), ConfigError> {
    check_range("i2cp.reduceIdleTime", seconds as i64, 6, u32::MAX as i64)?;
    check_range("i2cp.reduceQuantity", quantity as i64, 1, 16)?;
    self.reduce_idle = true;
    self.reduce_idle_time_s = seconds;
    self.reduce_idle_quantity = quantity;
    Ok(())
  }

  /// Enables close-on-idle after `millis` of inactivity
  pub fn set_close_idle(&mut self, millis: u32) -> Result<(), ConfigError> {
    check_range("i2cp.closeIdleTime", millis as i64, 300_000, u32::MAX as i64)?;
    self.close_idle = true;
    self.close_idle_time_ms = millis;
    Ok(())
  }

  pub fn set_access_list_type(&mut self, kind: &str) -> Result<(), ConfigError> {
    self.access_list_type = match kind {
      "whitelist" => AccessListType::Whitelist,
      "blacklist" => AccessListType::Blacklist,
      "none" | "" => AccessListType::None,
      other => return Err(ConfigError::InvalidAccessListType(other.to_owned())),
    };
    Ok(())
  }

  pub fn set_access_list<I, S>(&mut self, entries: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.access_list = entries.into_iter().map(Into::into).collect();
  }

  /// Sets the comma separated list of lease set encryption types, such as `4,0`
  pub fn set_lease_set_encryption(&mut self, types: &str) -> Result<(), ConfigError> {
    if types.is_empty() || types.split(',').any(|t| t.trim().parse::<u16>().is_err()) {
      return Err(ConfigError::InvalidLeaseSetEncryption(types.to_owned()));
    }
    self.lease_set_encryption = types.to_owned();
    Ok(())
  }

  /// Every tunnel option as `key=value` fragments, in a fixed order
  pub fn option_fragments(&self) -> Vec<String> {
    let mut fragments = vec![
      format!("inbound.length={}", self.in_length),
      format!("outbound.length={}", self.out_length),
      format!("inbound.lengthVariance={}", self.in_variance),
      format!("outbound.lengthVariance={}", self.out_variance),
      format!("inbound.backupQuantity={}", self.in_backup_quantity),
      format!("outbound.backupQuantity={}", self.out_backup_quantity),
      format!("inbound.quantity={}", self.in_quantity),
      format!("outbound.quantity={}", self.out_quantity),
      format!("i2cp.gzip={}", self.use_compression),
    ];
    if self.in_allow_zero_hop {
      fragments.push("inbound.allowZeroHop=true".to_owned());
    }
    if self.out_allow_zero_hop {
      fragments.push("outbound.allowZeroHop=true".to_owned());
    }
    if self.fast_receive {
      fragments.push("i2cp.fastReceive=true".to_owned());
    }
    if self.reduce_idle {
      fragments.push("i2cp.reduceOnIdle=true".to_owned());
      fragments.push(format!("i2cp.reduceIdleTime={}", u64::from(self.reduce_idle_time_s) * 1000));
      fragments.push(format!("i2cp.reduceQuantity={}", self.reduce_idle_quantity));
    }
    if self.close_idle {
      fragments.push("i2cp.closeOnIdle=true".to_owned());
      fragments.push(format!("i2cp.closeIdleTime={}", self.close_idle_time_ms));
    }
    if !self.message_reliability.is_empty() {
      fragments.push(format!(
        "i2cp.messageReliability={}",
        self.message_reliability
      ));
    }
    if self.encrypt_lease_set {
      fragments.push("i2cp.encryptLeaseSet=true".to_owned());
    }
    let lease_set_keys = [
      ("i2cp.leaseSetKey", &self.lease_set_key),
      ("i2cp.leaseSetPrivateKey", &self.lease_set_private_key),
      (
        "i2cp.leaseSetPrivateSigningKey",
        &self.lease_set_private_signing_key,
      ),
    ];
    for (key, value) in lease_set_keys {
      if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
        fragments.push(format!("{}={}", key, value));
      }
    }
    match self.access_list_type {
      AccessListType::Whitelist => fragments.push("i2cp.enableAccessList=true".to_owned()),
      AccessListType::Blacklist => fragments.push("i2cp.enableBlackList=true".to_owned()),
      AccessListType::None => {}
    }
    if self.access_list_type != AccessListType::None && !self.access_list.is_empty() {
      fragments.push(format!("i2cp.accessList={}", self.access_list.join(",")));
    }
    fragments.push(format!("i2cp.leaseSetEncType={}", self.lease_set_encryption));
    fragments
  }

  /// The assembled option string appended to session-create commands
  pub fn options_string(&self) -> String {
    self.option_fragments().join(" ")
  }

  /// The HELLO line offering this configuration's version range
  pub fn hello_command(&self) -> String {
    format!("HELLO VERSION MIN={} MAX={} \n", self.sam_min, self.sam_max)
  }
}
