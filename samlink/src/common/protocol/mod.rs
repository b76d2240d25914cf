// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire constants and helpers shared by every command of the bridge's line protocol

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::config::ConfigError;

pub mod control;
pub mod resolver;
pub mod session;

/// Upper bound on a single reply line read from a control connection
pub const MAX_REPLY_LENGTH: u64 = 64 * 1024;
/// Replies to HELLO are short; anything longer is not a bridge
pub const MAX_HELLO_LENGTH: u64 = 4 * 1024;
/// Partial writes are retried at most this many times before the command fails
pub const MAX_WRITE_ATTEMPTS: usize = 15;

pub const HELLO_OK: &str = "HELLO REPLY RESULT=OK";
pub const HELLO_NO_VERSION: &str = "HELLO REPLY RESULT=NOVERSION";

pub const SESSION_OK: &str = "SESSION STATUS RESULT=OK";
pub const SESSION_DUPLICATE_ID: &str = "SESSION STATUS RESULT=DUPLICATED_ID";
pub const SESSION_DUPLICATE_DEST: &str = "SESSION STATUS RESULT=DUPLICATED_DEST";
pub const SESSION_INVALID_KEY: &str = "SESSION STATUS RESULT=INVALID_KEY";
pub const SESSION_I2P_ERROR: &str = "SESSION STATUS RESULT=I2P_ERROR";

pub const STREAM_OK: &str = "STREAM STATUS RESULT=OK";
pub const NAMING_REPLY: &str = "NAMING REPLY ";

pub const TRANSIENT: &str = "TRANSIENT";
pub const DEFAULT_UDP_PORT: u16 = 7655;

/// A `major.minor` bridge protocol version
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SamVersion {
  pub major: u8,
  pub minor: u8,
}

impl SamVersion {
  pub const V3_0: SamVersion = SamVersion::new(3, 0);
  pub const V3_1: SamVersion = SamVersion::new(3, 1);

  pub const fn new(major: u8, minor: u8) -> Self {
    Self { major, minor }
  }

  /// Whether the port and signature-type fields may be sent
  pub fn supports_ports(&self) -> bool {
    *self >= Self::V3_1
  }
}

impl fmt::Display for SamVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.major, self.minor)
  }
}

impl FromStr for SamVersion {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || ConfigError::InvalidVersion(s.to_owned());
    let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
    Ok(Self {
      major: major.parse().map_err(|_| invalid())?,
      minor: minor.parse().map_err(|_| invalid())?,
    })
  }
}

impl TryFrom<String> for SamVersion {
  type Error = ConfigError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<SamVersion> for String {
  fn from(v: SamVersion) -> Self {
    v.to_string()
  }
}

/// Looks up a `KEY=value` token on a reply line
pub fn reply_value<'a>(reply: &'a str, key: &str) -> Option<&'a str> {
  reply.split_whitespace().find_map(|token| {
    token
      .strip_prefix(key)
      .and_then(|rest| rest.strip_prefix('='))
  })
}

#[cfg(test)]
mod tests {
  use super::{reply_value, SamVersion};

  #[test]
  fn versions_order_and_parse() {
    assert!(SamVersion::V3_0 < SamVersion::V3_1);
    assert_eq!("3.2".parse::<SamVersion>().unwrap(), SamVersion::new(3, 2));
    assert_eq!("3".parse::<SamVersion>().unwrap(), SamVersion::V3_0);
    assert!("3.x".parse::<SamVersion>().is_err());
    assert!(SamVersion::new(3, 3).supports_ports());
    assert!(!SamVersion::V3_0.supports_ports());
  }

  #[test]
  fn reply_value_matches_whole_keys() {
    let reply = "HELLO REPLY RESULT=OK VERSION=3.1";
    assert_eq!(reply_value(reply, "VERSION"), Some("3.1"));
    assert_eq!(reply_value(reply, "RESULT"), Some("OK"));
    assert_eq!(reply_value(reply, "VERS"), None);
  }
}
