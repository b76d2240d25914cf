// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! NAMING LOOKUP over an existing or a dedicated control connection

use super::{
  control::{CommandError, ConnectError, ControlConnection},
  SamVersion, NAMING_REPLY,
};
use crate::common::destination::{Destination, DestinationError};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
  #[error("Name not found: {message}")]
  KeyNotFound { name: String, message: String },
  #[error("Invalid name: {message}")]
  InvalidKey { message: String },
  #[error("Lookup failed: {message}")]
  Failed { message: String },
  #[error("Malformed naming reply {0:?}")]
  MalformedReply(String),
  #[error("Bridge resolved the name to an invalid destination")]
  InvalidDestination(#[from] DestinationError),
  #[error("Could not reach the bridge for a lookup")]
  Connect(#[from] ConnectError),
  #[error("Lookup command failed")]
  Command(#[from] CommandError),
}

/// Interprets a `NAMING REPLY` line; the first `VALUE=` token wins
pub fn parse_naming_reply(reply: &str, name: &str) -> Result<Destination, ResolveError> {
  let body = match reply.strip_prefix(NAMING_REPLY) {
    Some(body) if reply.len() > NAMING_REPLY.len() => body,
    _ => return Err(ResolveError::MalformedReply(reply.to_owned())),
  };
  let own_name = format!("NAME={}", name);
  let mut message = String::new();
  let mut not_found = false;
  let mut invalid = false;
  let mut append = |text: &str| {
    if !message.is_empty() {
      message.push(' ');
    }
    message.push_str(text);
  };
  for token in body.split_whitespace() {
    match token {
      "RESULT=OK" => {}
      "RESULT=INVALID_KEY" => {
        invalid = true;
        append("invalid key");
      }
      "RESULT=KEY_NOT_FOUND" => {
        not_found = true;
        append(&format!("unable to resolve {}", name));
      }
      t if t == own_name => {}
      t => {
        if let Some(value) = t.strip_prefix("VALUE=") {
          return Ok(Destination::new(value)?);
        } else if let Some(text) = t.strip_prefix("MESSAGE=") {
          append(text);
        }
      }
    }
  }
  Err(if not_found {
    ResolveError::KeyNotFound {
      name: name.to_owned(),
      message,
    }
  } else if invalid {
    ResolveError::InvalidKey { message }
  } else {
    ResolveError::Failed { message }
  })
}

/// Resolves `name` on an already handshaked connection
#[tracing::instrument(level = "debug", skip(conn), err)]
pub async fn lookup(conn: &mut ControlConnection, name: &str) -> Result<Destination, ResolveError> {
  let reply = conn.command(&format!("NAMING LOOKUP NAME={}\n", name)).await?;
  parse_naming_reply(&reply, name)
}

/// Resolves `name` over a connection opened for this lookup alone
pub async fn lookup_at(
  address: &str,
  min: SamVersion,
  max: SamVersion,
  name: &str,
) -> Result<Destination, ResolveError> {
  let mut conn = ControlConnection::connect(address, min, max).await?;
  let resolved = lookup(&mut conn, name).await;
  let _ = conn.close().await;
  resolved
}
