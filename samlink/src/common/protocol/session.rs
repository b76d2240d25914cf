// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SESSION CREATE / SESSION ADD command assembly and reply classification

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::{
  control::{CommandError, ControlConnection},
  SamVersion, SESSION_DUPLICATE_DEST, SESSION_DUPLICATE_ID, SESSION_I2P_ERROR,
  SESSION_INVALID_KEY, SESSION_OK, TRANSIENT,
};
use crate::common::{
  config::ConfigError,
  destination::{DestinationKeys, SignatureType},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStyle {
  Stream,
  Datagram,
  Raw,
  Primary,
}

impl SessionStyle {
  pub fn as_str(&self) -> &'static str {
    match self {
      SessionStyle::Stream => "STREAM",
      SessionStyle::Datagram => "DATAGRAM",
      SessionStyle::Raw => "RAW",
      SessionStyle::Primary => "PRIMARY",
    }
  }
}

impl fmt::Display for SessionStyle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SessionStyle {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "STREAM" => Ok(SessionStyle::Stream),
      "DATAGRAM" => Ok(SessionStyle::Datagram),
      "RAW" => Ok(SessionStyle::Raw),
      // MASTER is the pre-0.9.47 name of PRIMARY
      "PRIMARY" | "MASTER" => Ok(SessionStyle::Primary),
      _ => Err(ConfigError::InvalidStyle(s.to_owned())),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Session id is already in use at the bridge")]
  DuplicateId,
  #[error("Destination is already in use by another session")]
  DuplicateDestination,
  #[error("Bridge rejected the destination keys")]
  InvalidKey,
  #[error("Bridge reported an internal error: {0}")]
  BridgeError(String),
  #[error("Unparseable session reply {0:?}")]
  UnparseableReply(String),
  #[error("Bridge created the session for a different destination than requested")]
  UnexpectedDestination { echoed: String },
  #[error("Session command failed")]
  Command(#[from] CommandError),
}

/// Everything needed to assemble one session-creation command
#[derive(Clone, Debug)]
pub struct SessionRequest<'a> {
  pub style: SessionStyle,
  pub id: &'a str,
  /// `None` asks the bridge for transient keys
  pub keys: Option<&'a DestinationKeys>,
  pub signature: Option<SignatureType>,
  pub from_port: u16,
  pub to_port: u16,
  /// Assembled tunnel options
  pub options: &'a str,
  pub extras: &'a [String],
}

impl<'a> SessionRequest<'a> {
  pub fn new(style: SessionStyle, id: &'a str) -> Self {
    Self {
      style,
      id,
      keys: None,
      signature: None,
      from_port: 0,
      to_port: 0,
      options: "",
      extras: &[],
    }
  }

  fn port_fields(&self, version: SamVersion, fields: &mut Vec<String>) {
    if !version.supports_ports() {
      return;
    }
    if self.from_port != 0 {
      fields.push(format!("FROM_PORT={}", self.from_port));
    }
    if self.to_port != 0 {
      fields.push(format!("TO_PORT={}", self.to_port));
    }
  }

  fn finish(&self, mut fields: Vec<String>) -> String {
    fields.extend(
      self
        .extras
        .iter()
        .filter(|extra| !extra.is_empty())
        .cloned(),
    );
    let mut command = fields.join(" ");
    command.push('\n');
    command
  }

  /// `SESSION CREATE STYLE=.. [FROM_PORT=..] [TO_PORT=..] ID=.. DESTINATION=.. [SIGNATURE_TYPE=..] <options> <extras>`
  pub fn create_command(&self, version: SamVersion) -> String {
    let mut fields = vec![
      "SESSION CREATE".to_owned(),
      format!("STYLE={}", self.style),
    ];
    self.port_fields(version, &mut fields);
    fields.push(format!("ID={}", self.id));
    fields.push(format!(
      "DESTINATION={}",
      self.keys.map(|k| k.private_key()).unwrap_or(TRANSIENT)
    ));
    if let Some(signature) = self.signature.filter(|_| version.supports_ports()) {
      fields.push(format!("SIGNATURE_TYPE={}", signature));
    }
    if !self.options.is_empty() {
      fields.push(self.options.to_owned());
    }
    self.finish(fields)
  }

  /// `SESSION ADD STYLE=.. ID=.. [FROM_PORT=..] [TO_PORT=..] <extras>`
  ///
  /// Sub-sessions share the tunnels of their primary, so no tunnel options are sent.
  pub fn add_command(&self, version: SamVersion) -> String {
    let mut fields = vec![
      "SESSION ADD".to_owned(),
      format!("STYLE={}", self.style),
      format!("ID={}", self.id),
    ];
    self.port_fields(version, &mut fields);
    self.finish(fields)
  }
}

/// Classifies a `SESSION STATUS` reply, returning the echoed destination on success
///
/// When `requested` is set, the echoed destination must match it exactly.
pub fn parse_session_status(reply: &str, requested: Option<&str>) -> Result<String, SessionError> {
  let reply = reply.trim();
  if let Some(rest) = reply.strip_prefix(SESSION_OK) {
    let echoed = rest.trim();
    let echoed = echoed.strip_prefix("DESTINATION=").unwrap_or(echoed);
    return match requested {
      Some(requested) if requested != echoed => Err(SessionError::UnexpectedDestination {
        echoed: echoed.to_owned(),
      }),
      _ => Ok(echoed.to_owned()),
    };
  }
  match reply {
    SESSION_DUPLICATE_ID => Err(SessionError::DuplicateId),
    SESSION_DUPLICATE_DEST => Err(SessionError::DuplicateDestination),
    SESSION_INVALID_KEY => Err(SessionError::InvalidKey),
    _ => match reply.strip_prefix(SESSION_I2P_ERROR) {
      Some(detail) => {
        let detail = detail.trim();
        let detail = detail.strip_prefix("MESSAGE=").unwrap_or(detail);
        Err(SessionError::BridgeError(detail.trim_matches('"').to_owned()))
      }
      None => Err(SessionError::UnparseableReply(reply.to_owned())),
    },
  }
}

/// Creates a top-level session on `conn`, returning the keys it is bound to
///
/// Transient requests adopt the keys echoed by the bridge. Every failure
/// closes the connection.
#[tracing::instrument(level = "debug", skip_all, fields(style = %request.style, id = request.id), err)]
pub async fn create_session(
  conn: &mut ControlConnection,
  request: &SessionRequest<'_>,
) -> Result<DestinationKeys, SessionError> {
  let command = request.create_command(conn.version());
  let outcome = async {
    let reply = conn.command(&command).await?;
    let echoed = parse_session_status(&reply, request.keys.map(|k| k.private_key()))?;
    match request.keys {
      Some(keys) => Ok(keys.clone()),
      None => DestinationKeys::from_private(&echoed)
        .map_err(|_| SessionError::UnparseableReply(reply.clone())),
    }
  }
  .await;
  finish(conn, outcome).await
}

/// Adds a sub-session on a primary session's keeper connection
#[tracing::instrument(level = "debug", skip_all, fields(style = %request.style, id = request.id), err)]
pub async fn add_session(
  conn: &mut ControlConnection,
  request: &SessionRequest<'_>,
) -> Result<(), SessionError> {
  let command = request.add_command(conn.version());
  let outcome = async {
    let reply = conn.command(&command).await?;
    parse_session_status(&reply, None).map(|_| ())
  }
  .await;
  finish(conn, outcome).await
}

async fn finish<T>(
  conn: &mut ControlConnection,
  outcome: Result<T, SessionError>,
) -> Result<T, SessionError> {
  if let Err(e) = &outcome {
    tracing::warn!(error = %e, "Session establishment failed; closing control connection");
    let _ = conn.close().await;
  }
  outcome
}
