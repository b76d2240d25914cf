// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The bridge controller: key generation, lookups, and session construction

use std::{io, path::Path, sync::Arc};

use tokio::sync::Mutex;

use super::{
  config::SamConfig,
  destination::{Destination, DestinationError, DestinationKeys, SignatureType},
  protocol::{
    control::{CommandError, ConnectError, ControlConnection},
    resolver::{self, ResolveError},
    session::{create_session, SessionError, SessionRequest, SessionStyle},
    SamVersion,
  },
  session::SessionCore,
};
use crate::{
  datagram::{self, DatagramError, DatagramSession, RawSession},
  primary::PrimarySession,
  stream::StreamSession,
};

#[derive(thiserror::Error, Debug)]
pub enum KeygenError {
  #[error("Unexpected token {0:?} in key generation reply")]
  UnexpectedToken(String),
  #[error("Key generation reply lacks its {0} key")]
  MissingKey(&'static str),
  #[error("Generated keys are malformed")]
  Destination(#[from] DestinationError),
  #[error("Key generation command failed")]
  Command(#[from] CommandError),
}

/// A handshaked connection to the bridge, plus the configuration sessions are built from
///
/// Each session constructor consumes the controller; its connection becomes
/// the new session's keeper.
#[derive(Debug)]
pub struct Sam {
  conn: ControlConnection,
  config: SamConfig,
}

impl Sam {
  pub async fn connect(config: SamConfig) -> Result<Self, ConnectError> {
    let conn =
      ControlConnection::connect(&config.sam_address(), config.sam_min, config.sam_max).await?;
    Ok(Self { conn, config })
  }

  pub fn config(&self) -> &SamConfig {
    &self.config
  }

  pub fn config_mut(&mut self) -> &mut SamConfig {
    &mut self.config
  }

  pub fn version(&self) -> SamVersion {
    self.conn.version()
  }

  /// Asks the bridge for a fresh destination
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn new_keys(
    &mut self,
    signature: Option<SignatureType>,
  ) -> Result<DestinationKeys, KeygenError> {
    let signature = signature.or(self.config.signature_type);
    let command = match signature {
      Some(signature) => format!("DEST GENERATE SIGNATURE_TYPE={}\n", signature),
      None => "DEST GENERATE\n".to_owned(),
    };
    let reply = self.conn.command(&command).await?;
    parse_generated_keys(&reply, signature.unwrap_or_default())
  }

  pub async fn lookup(&mut self, name: &str) -> Result<Destination, ResolveError> {
    resolver::lookup(&mut self.conn, name).await
  }

  /// Loads keys from `path`, generating and storing them if the file does not exist yet
  ///
  /// Without a path, fresh keys are generated and not persisted. Either way
  /// the keys become the identity of sessions built from this controller.
  pub async fn ensure_keyfile<P: AsRef<Path>>(
    &mut self,
    path: Option<P>,
  ) -> Result<DestinationKeys, KeygenError> {
    let keys = match path {
      None => self.new_keys(None).await?,
      Some(path) => match DestinationKeys::load(path.as_ref()).await {
        Ok(keys) => keys,
        Err(DestinationError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
          let keys = self.new_keys(None).await?;
          keys.store(path.as_ref()).await?;
          tracing::info!(path = %path.as_ref().display(), "Stored newly generated keys");
          keys
        }
        Err(e) => return Err(e.into()),
      },
    };
    self.config.destination_keys = Some(keys.clone());
    Ok(keys)
  }

  /// Creates a session of `style` on the controller's connection
  pub(crate) async fn establish(
    mut self,
    style: SessionStyle,
    extras: &[String],
  ) -> Result<SessionCore, SessionError> {
    let id = self.config.id().to_owned();
    let options = self.config.options_string();
    let mut request = SessionRequest::new(style, &id);
    request.keys = self.config.destination_keys.as_ref();
    request.signature = self.config.signature_type;
    request.from_port = self.config.from_port;
    request.to_port = self.config.to_port;
    request.options = &options;
    request.extras = extras;
    let keys = create_session(&mut self.conn, &request).await?;
    tracing::info!(id = %id, style = %style, "Session established");
    let version = self.conn.version();
    Ok(
      SessionCore::new(
        id,
        style,
        keys,
        self.config.sam_address(),
        self.config.sam_min,
        version,
        Arc::new(Mutex::new(self.conn)),
        true,
      )
      .with_ports(self.config.from_port, self.config.to_port),
    )
  }

  pub async fn new_stream_session(self) -> Result<StreamSession, SessionError> {
    Ok(StreamSession::from_core(
      self.establish(SessionStyle::Stream, &[]).await?,
    ))
  }

  /// `udp_port` is the bridge's UDP relay port; 0 selects the default
  pub async fn new_datagram_session(self, udp_port: u32) -> Result<DatagramSession, DatagramError> {
    let (socket, relay, extras) =
      datagram::prepare_channel(self.conn.local_addr(), self.conn.peer_addr(), udp_port).await?;
    let core = self.establish(SessionStyle::Datagram, &extras).await?;
    Ok(DatagramSession::from_parts(core, socket, relay))
  }

  pub async fn new_raw_session(self, udp_port: u32) -> Result<RawSession, DatagramError> {
    let (socket, relay, extras) =
      datagram::prepare_channel(self.conn.local_addr(), self.conn.peer_addr(), udp_port).await?;
    let core = self.establish(SessionStyle::Raw, &extras).await?;
    Ok(RawSession::from_parts(core, socket, relay))
  }

  pub async fn new_primary_session(self) -> Result<PrimarySession, SessionError> {
    Ok(PrimarySession::from_core(
      self.establish(SessionStyle::Primary, &[]).await?,
    ))
  }

  pub async fn close(mut self) -> io::Result<()> {
    self.conn.close().await
  }
}

/// Collects the `PUB=` and `PRIV=` tokens of a `DEST REPLY`
pub fn parse_generated_keys(
  reply: &str,
  requested: SignatureType,
) -> Result<DestinationKeys, KeygenError> {
  let (mut public, mut private) = (None, None);
  for token in reply.split_whitespace() {
    match token {
      "DEST" | "REPLY" => {}
      t if t.starts_with("PUB=") => public = Some(&t[4..]),
      t if t.starts_with("PRIV=") => private = Some(&t[5..]),
      t => return Err(KeygenError::UnexpectedToken(t.to_owned())),
    }
  }
  let public = Destination::new(public.ok_or(KeygenError::MissingKey("public"))?)?;
  let private = private.ok_or(KeygenError::MissingKey("private"))?;
  let signature = DestinationKeys::from_private(private)
    .map(|keys| keys.signature_type())
    .unwrap_or(requested);
  Ok(DestinationKeys::new(public, private.to_owned(), signature))
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{parse_generated_keys, KeygenError, Sam};
  use crate::{
    common::{
      destination::{tests::sample_keys, DestinationKeys, SignatureType},
      session::Session,
    },
    util::test_bridge::{hello, FakeBridge, Step},
  };

  fn dest_reply(keys: &DestinationKeys) -> String {
    format!(
      "DEST REPLY PUB={} PRIV={}\n",
      keys.address(),
      keys.private_key()
    )
  }

  #[test]
  fn generated_keys_parse() {
    let keys = sample_keys(4, SignatureType::EcdsaSha256P256);
    let parsed = parse_generated_keys(dest_reply(&keys).trim(), SignatureType::default()).unwrap();
    assert_eq!(parsed, keys);
    assert!(matches!(
      parse_generated_keys("DEST REPLY RESULT=I2P_ERROR", SignatureType::default()),
      Err(KeygenError::UnexpectedToken(t)) if t == "RESULT=I2P_ERROR"
    ));
    assert!(matches!(
      parse_generated_keys("DEST REPLY PUB=AAAA", SignatureType::default()),
      Err(KeygenError::MissingKey("private"))
    ));
  }

  #[tokio::test]
  async fn keyfile_is_generated_once() {
    let keys = sample_keys(5, SignatureType::EdDsaSha512Ed25519);
    let bridge = FakeBridge::spawn(vec![
      vec![
        hello(),
        Step::reply(
          "DEST GENERATE SIGNATURE_TYPE=EdDSA_SHA512_Ed25519",
          &dest_reply(&keys),
        ),
        Step::Hold,
      ],
      vec![hello(), Step::Hold],
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunnel.keys");

    let mut config = bridge.config();
    config.signature_type = Some(SignatureType::EdDsaSha512Ed25519);
    let mut sam = Sam::connect(config.clone()).await.unwrap();
    let generated = sam.ensure_keyfile(Some(&path)).await.unwrap();
    assert_eq!(generated, keys);
    assert_eq!(sam.config().destination_keys.as_ref(), Some(&keys));

    // The second controller finds the file and asks the bridge for nothing
    let mut sam = Sam::connect(config).await.unwrap();
    let loaded = sam.ensure_keyfile(Some(&path)).await.unwrap();
    assert_eq!(loaded, keys);
    sam.close().await.unwrap();
    assert_eq!(bridge.received(1).await.len(), 1);
  }

  #[tokio::test]
  async fn stream_session_uses_configured_identity() {
    let keys = sample_keys(6, SignatureType::EdDsaSha512Ed25519);
    let reply = format!("SESSION STATUS RESULT=OK DESTINATION={}\n", keys.private_key());
    let bridge = FakeBridge::spawn(vec![vec![
      hello(),
      Step::reply("SESSION CREATE STYLE=STREAM ID=named", &reply),
      Step::Hold,
    ]])
    .await;
    let mut config = bridge.config();
    config.set_tunnel_name("named");
    config.destination_keys = Some(keys.clone());
    let sam = Sam::connect(config).await.unwrap();
    let session = tokio::time::timeout(Duration::from_secs(5), sam.new_stream_session())
      .await
      .expect("Must not time out")
      .expect("Session must be created");
    assert_eq!(session.id(), "named");
    assert_eq!(session.addr(), keys.address());
    let sent = bridge.received(0).await;
    assert!(sent[1].contains(&format!("DESTINATION={}", keys.private_key())));
    assert!(sent[1].contains("inbound.length=3"));
    session.close().await.unwrap();
  }
}
