// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{future::Future, sync::Arc};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use super::{PrimaryError, SubSession};

/// Kind of sub-session a dial network maps to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NetworkKind {
  Stream,
  Datagram,
}

impl NetworkKind {
  pub fn of(network: &str) -> Result<Self, PrimaryError> {
    match network {
      "tcp" | "tcp4" | "tcp6" => Ok(NetworkKind::Stream),
      "udp" | "udp4" | "udp6" => Ok(NetworkKind::Datagram),
      other => Err(PrimaryError::UnsupportedNetwork(other.to_owned())),
    }
  }
}

/// Registry key for a dial: the network followed by the first 4 characters of the address
///
/// Distinct destinations sharing a 4 character prefix share a sub-session.
pub fn routing_key(network: &str, addr: &str) -> String {
  let prefix: String = addr.chars().take(4).collect();
  format!("{}{}", network, prefix)
}

/// Sub-sessions created by dials, one per routing key, kept for the primary's lifetime
#[derive(Debug, Default)]
pub struct SubSessionRegistry {
  entries: DashMap<String, Arc<OnceCell<SubSession>>>,
}

impl SubSessionRegistry {
  /// Returns the sub-session for `key`, creating it with `create` if none exists
  ///
  /// Concurrent callers for the same key wait on a single creation. A failed
  /// creation leaves the key vacant for the next caller.
  pub async fn get_or_create<F, Fut>(&self, key: &str, create: F) -> Result<SubSession, PrimaryError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<SubSession, PrimaryError>>,
  {
    let cell = self.entries.entry(key.to_owned()).or_default().clone();
    cell.get_or_try_init(create).await.cloned()
  }

  pub fn get(&self, key: &str) -> Option<SubSession> {
    self
      .entries
      .get(key)
      .and_then(|cell| cell.value().get().cloned())
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .iter()
      .filter(|entry| entry.value().initialized())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn sessions(&self) -> Vec<SubSession> {
    self
      .entries
      .iter()
      .filter_map(|entry| entry.value().get().cloned())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::{routing_key, NetworkKind};
  use crate::primary::PrimaryError;

  #[test]
  fn routing_keys_use_four_character_prefix() {
    assert_eq!(routing_key("tcp", "abcdefgh.i2p"), "tcpabcd");
    assert_eq!(routing_key("udp6", "ab"), "udp6ab");
    assert_eq!(
      routing_key("tcp", "abcdXXXX"),
      routing_key("tcp", "abcdYYYY")
    );
  }

  #[test]
  fn networks_map_to_styles() {
    assert_eq!(NetworkKind::of("tcp6").unwrap(), NetworkKind::Stream);
    assert_eq!(NetworkKind::of("udp4").unwrap(), NetworkKind::Datagram);
    assert!(matches!(
      NetworkKind::of("unix"),
      Err(PrimaryError::UnsupportedNetwork(n)) if n == "unix"
    ));
  }
}
