// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;

use crate::common::{
  config::SamConfig,
  destination::{Destination, SignatureType},
};

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

/// Accepts `host[:port]` as understood by [SamConfig::set_sam_address]
pub fn parse_sam_address(v: &str) -> Result<String> {
  let mut config = SamConfig::default();
  config.set_sam_address(v)?;
  Ok(config.sam_address())
}

pub fn parse_signature_type(v: &str) -> Result<SignatureType> {
  v.parse::<SignatureType>().map_err(Into::into)
}

/// Accepts either a `.i2p` name or a base64 destination
pub fn parse_target(v: &str) -> Result<String> {
  if Destination::is_name(v) {
    Ok(v.to_owned())
  } else {
    Destination::new(v)
      .map(|d| d.to_string())
      .map_err(|e| AnyErr::new(e).context("Target is neither an .i2p name nor a destination"))
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_sam_address(v: &str) -> Result<(), String> {
  parse_sam_address(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_signature_type(v: &str) -> Result<(), String> {
  parse_signature_type(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_target(v: &str) -> Result<(), String> {
  parse_target(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}
