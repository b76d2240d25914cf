// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reliable byte streams between destinations
//!
//! Every dial and every accept opens its own control connection to the
//! bridge; once the bridge acknowledges it, that connection carries the
//! stream's bytes.

use crate::common::{
  destination::{Destination, DestinationError},
  protocol::{
    control::{CommandError, ConnectError},
    reply_value,
    resolver::ResolveError,
    SamVersion,
  },
};

mod conn;
mod listener;
mod session;

pub use conn::StreamConn;
pub use listener::StreamListener;
pub use session::{DialContext, StreamSession};

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
  #[error("Peer unreachable: {0}")]
  CantReachPeer(String),
  #[error("Bridge reported an internal error: {0}")]
  I2pError(String),
  #[error("Bridge rejected the destination key: {0}")]
  InvalidKey(String),
  #[error("Bridge does not know the session id: {0}")]
  InvalidId(String),
  #[error("Bridge timed out connecting to the peer: {0}")]
  Timeout(String),
  #[error("Unknown result {token:?} in stream reply {reply:?}")]
  UnknownReply { token: String, reply: String },
  #[error("Invalid accept reply {0:?}")]
  InvalidReply(String),
  #[error("Invalid dial target {0:?}")]
  InvalidTarget(String),
  #[error("Dial deadline exceeded")]
  DeadlineExceeded,
  #[error("Dial cancelled")]
  Cancelled,
  #[error("Session is closed")]
  Closed,
  #[error("Malformed destination")]
  Destination(#[from] DestinationError),
  #[error("Name resolution failed")]
  Resolve(#[from] ResolveError),
  #[error("Could not open a connection to the bridge")]
  Connect(#[from] ConnectError),
  #[error("Stream command failed")]
  Command(#[from] CommandError),
}

/// The human-readable `MESSAGE=` part of a reply, which may be quoted and contain spaces
fn reply_message(reply: &str) -> String {
  match reply.find("MESSAGE=") {
    Some(at) => reply[at + "MESSAGE=".len()..]
      .trim()
      .trim_matches('"')
      .to_owned(),
    None => String::new(),
  }
}

/// Classifies a `STREAM STATUS` reply by its first significant token
pub fn parse_stream_status(reply: &str) -> Result<(), StreamError> {
  let token = reply
    .split_whitespace()
    .find(|t| !matches!(*t, "STREAM" | "STATUS"))
    .unwrap_or_default();
  let message = || reply_message(reply);
  match token {
    "RESULT=OK" => Ok(()),
    "RESULT=CANT_REACH_PEER" => Err(StreamError::CantReachPeer(message())),
    "RESULT=I2P_ERROR" => Err(StreamError::I2pError(message())),
    "RESULT=INVALID_KEY" => Err(StreamError::InvalidKey(message())),
    "RESULT=INVALID_ID" => Err(StreamError::InvalidId(message())),
    "RESULT=TIMEOUT" => Err(StreamError::Timeout(message())),
    other => Err(StreamError::UnknownReply {
      token: other.to_owned(),
      reply: reply.to_owned(),
    }),
  }
}

/// `STREAM CONNECT ID=.. [FROM_PORT=..] [TO_PORT=..] DESTINATION=.. SILENT=false`
pub fn connect_command(
  id: &str,
  version: SamVersion,
  from_port: u16,
  to_port: u16,
  destination: &Destination,
) -> String {
  let mut command = format!("STREAM CONNECT ID={}", id);
  if version.supports_ports() {
    if from_port != 0 {
      command.push_str(&format!(" FROM_PORT={}", from_port));
    }
    if to_port != 0 {
      command.push_str(&format!(" TO_PORT={}", to_port));
    }
  }
  command.push_str(&format!(" DESTINATION={} SILENT=false\n", destination));
  command
}

/// Parses the line following an accepted `STREAM STATUS RESULT=OK`
///
/// Returns the remote destination and its `FROM_PORT` / `TO_PORT`, 0 when absent.
pub fn parse_accept_line(line: &str) -> Result<(Destination, u16, u16), StreamError> {
  let remote = line
    .split_whitespace()
    .next()
    .ok_or_else(|| StreamError::InvalidReply(line.to_owned()))?;
  let remote = Destination::new(remote)?;
  let port = |key| {
    reply_value(line, key)
      .and_then(|p| p.parse::<u16>().ok())
      .unwrap_or(0)
  };
  Ok((remote, port("FROM_PORT"), port("TO_PORT")))
}
