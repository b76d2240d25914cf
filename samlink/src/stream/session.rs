// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
  connect_command, parse_accept_line, parse_stream_status, StreamConn, StreamError, StreamListener,
};
use crate::common::{
  destination::{Destination, DestinationKeys},
  protocol::{session::SessionStyle, STREAM_OK},
  session::{Session, SessionCore},
};

/// Per-call limits for [StreamSession::dial_context]
#[derive(Clone, Debug, Default)]
pub struct DialContext {
  pub deadline: Option<Instant>,
  pub cancel: CancellationToken,
}

impl DialContext {
  pub fn with_deadline(deadline: Instant) -> Self {
    Self {
      deadline: Some(deadline),
      ..Default::default()
    }
  }
}

/// Ports reported by the most recent accept
///
/// Shared by every clone of the session; concurrent accepts overwrite each
/// other, so callers reading ports alongside further accepts must serialize.
#[derive(Copy, Clone, Debug, Default)]
struct PortState {
  from: u16,
  to: u16,
}

#[derive(Debug, Default)]
struct DialLimits {
  timeout: Option<Duration>,
  deadline: Option<Instant>,
}

#[derive(Debug)]
struct StreamInner {
  core: SessionCore,
  ports: Mutex<PortState>,
  limits: Mutex<DialLimits>,
}

/// A STREAM-style session; clones share the same tunnel
#[derive(Clone, Debug)]
pub struct StreamSession {
  inner: Arc<StreamInner>,
}

/// The earliest of the candidates that are set
pub(crate) fn earliest(candidates: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
  candidates.into_iter().flatten().min()
}

/// Splits an optional `:port` suffix off a dial target
fn split_target(addr: &str) -> &str {
  match addr.rsplit_once(':') {
    Some((host, port)) if port.parse::<u16>().is_ok() => host,
    _ => addr,
  }
}

impl StreamSession {
  pub(crate) fn from_core(core: SessionCore) -> Self {
    let ports = PortState {
      from: core.from_port,
      to: core.to_port,
    };
    Self {
      inner: Arc::new(StreamInner {
        core,
        ports: Mutex::new(ports),
        limits: Default::default(),
      }),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.core.is_closed()
  }

  fn ports(&self) -> PortState {
    *self
      .inner
      .ports
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// FROM_PORT of the last accepted stream, or the configured one before any accept
  pub fn from_port(&self) -> u16 {
    self.ports().from
  }

  /// TO_PORT of the last accepted stream, or the configured one before any accept
  pub fn to_port(&self) -> u16 {
    self.ports().to
  }

  /// Bounds every dial to `timeout` from its start
  pub fn set_timeout(&self, timeout: Option<Duration>) {
    self
      .inner
      .limits
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .timeout = timeout;
  }

  /// Bounds every dial to an absolute deadline
  pub fn set_deadline(&self, deadline: Option<Instant>) {
    self
      .inner
      .limits
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .deadline = deadline;
  }

  fn effective_deadline(&self, requested: Option<Instant>, now: Instant) -> Option<Instant> {
    let limits = self
      .inner
      .limits
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    earliest([
      requested,
      limits.timeout.map(|t| now + t),
      limits.deadline,
    ])
  }

  /// Resolves a name over a dedicated connection
  pub async fn lookup(&self, name: &str) -> Result<Destination, StreamError> {
    Ok(self.inner.core.lookup(name).await?)
  }

  /// Dials `host[:port]`, where host is a `.i2p` name or a base64 destination
  ///
  /// The port is accepted for address compatibility and ignored.
  pub async fn dial(&self, addr: &str) -> Result<StreamConn, StreamError> {
    if self.is_closed() {
      return Err(StreamError::Closed);
    }
    let host = split_target(addr);
    if host.is_empty() {
      return Err(StreamError::InvalidTarget(addr.to_owned()));
    }
    let destination = if Destination::is_name(host) {
      self.lookup(host).await?
    } else {
      Destination::new(host)?
    };
    self.dial_destination(&destination).await
  }

  /// Dials with a per-call deadline and cancellation
  ///
  /// The effective deadline is the earliest of the context's deadline, the
  /// session timeout counted from now, and the session deadline.
  pub async fn dial_context(
    &self,
    context: &DialContext,
    addr: &str,
  ) -> Result<StreamConn, StreamError> {
    let deadline = self.effective_deadline(context.deadline, Instant::now());
    let bounded = async {
      match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, self.dial(addr))
          .await
          .map_err(|_| StreamError::DeadlineExceeded)?,
        None => self.dial(addr).await,
      }
    };
    tokio::select! {
      biased;
      _ = context.cancel.cancelled() => Err(StreamError::Cancelled),
      res = bounded => res,
    }
  }

  /// Opens a stream to `destination` over a new control connection
  #[tracing::instrument(level = "debug", skip_all, fields(id = self.inner.core.id(), remote = ?destination), err)]
  pub async fn dial_destination(&self, destination: &Destination) -> Result<StreamConn, StreamError> {
    let core = &self.inner.core;
    if core.is_closed() {
      return Err(StreamError::Closed);
    }
    let mut conn = core.connect().await?;
    let command = connect_command(
      core.id(),
      conn.version(),
      core.from_port,
      core.to_port,
      destination,
    );
    let reply = conn.command(&command).await?;
    if let Err(e) = parse_stream_status(&reply) {
      tracing::warn!(error = %e, "Stream connect refused");
      let _ = conn.close().await;
      return Err(e);
    }
    Ok(StreamConn::new(
      conn.into_stream(),
      core.keys().address().clone(),
      destination.clone(),
    ))
  }

  /// A listener for inbound streams; performs no I/O
  pub fn listen(&self) -> StreamListener {
    StreamListener::new(self.clone())
  }

  /// Waits for one inbound stream over a new control connection
  #[tracing::instrument(level = "debug", skip_all, fields(id = self.inner.core.id()), err)]
  pub(crate) async fn accept(&self) -> Result<StreamConn, StreamError> {
    let core = &self.inner.core;
    if core.is_closed() {
      return Err(StreamError::Closed);
    }
    let mut conn = core.connect().await?;
    let status = conn
      .command(&format!("STREAM ACCEPT ID={} SILENT=false\n", core.id()))
      .await?;
    if !status.starts_with(STREAM_OK) {
      let _ = conn.close().await;
      return Err(StreamError::InvalidReply(status));
    }
    let line = conn.read_reply().await?;
    let (remote, from, to) = match parse_accept_line(&line) {
      Ok(parsed) => parsed,
      Err(e) => {
        let _ = conn.close().await;
        return Err(e);
      }
    };
    *self
      .inner
      .ports
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = PortState { from, to };
    tracing::debug!(remote = ?remote, from, to, "Accepted inbound stream");
    Ok(
      StreamConn::new(conn.into_stream(), core.keys().address().clone(), remote)
        .with_ports(from, to),
    )
  }
}

impl Session for StreamSession {
  fn id(&self) -> &str {
    self.inner.core.id()
  }

  fn style(&self) -> SessionStyle {
    self.inner.core.style()
  }

  fn keys(&self) -> &DestinationKeys {
    self.inner.core.keys()
  }

  fn close(&self) -> BoxFuture<'_, io::Result<()>> {
    self.inner.core.close().boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
  };

  use super::{earliest, split_target, DialContext, StreamSession};
  use crate::{
    common::{
      destination::{tests::sample_keys, SignatureType},
      sam::Sam,
      session::Session,
    },
    stream::StreamError,
    util::test_bridge::{hello, FakeBridge, Step},
  };

  async fn session(bridge: &FakeBridge, name: &str) -> StreamSession {
    let keys = sample_keys(7, SignatureType::EdDsaSha512Ed25519);
    let mut config = bridge.config();
    config.set_tunnel_name(name);
    config.destination_keys = Some(keys);
    let sam = Sam::connect(config).await.expect("Handshake");
    sam.new_stream_session().await.expect("Session")
  }

  fn create_step() -> Step {
    let keys = sample_keys(7, SignatureType::EdDsaSha512Ed25519);
    Step::reply(
      "SESSION CREATE",
      &format!("SESSION STATUS RESULT=OK DESTINATION={}\n", keys.private_key()),
    )
  }

  #[test]
  fn earliest_ignores_unset_candidates() {
    let now = Instant::now();
    let later = now + Duration::from_secs(5);
    assert_eq!(earliest([None, None]), None);
    assert_eq!(earliest([Some(later), None, Some(now)]), Some(now));
    assert_eq!(earliest([None, Some(later)]), Some(later));
  }

  #[test]
  fn dial_targets_drop_ports() {
    assert_eq!(split_target("example.i2p:80"), "example.i2p");
    assert_eq!(split_target("example.i2p"), "example.i2p");
    assert_eq!(split_target("AAAA~"), "AAAA~");
  }

  #[tokio::test]
  async fn dial_resolves_names_and_carries_bytes() {
    let remote = sample_keys(8, SignatureType::EdDsaSha512Ed25519);
    let naming = format!(
      "NAMING REPLY RESULT=OK NAME=peer.i2p VALUE={}\n",
      remote.address()
    );
    let bridge = FakeBridge::spawn(vec![
      vec![hello(), create_step(), Step::Hold],
      vec![hello(), Step::reply("NAMING LOOKUP NAME=peer.i2p", &naming), Step::Hold],
      vec![
        hello(),
        Step::reply("STREAM CONNECT ID=dialer", "STREAM STATUS RESULT=OK\n"),
        Step::Echo,
      ],
    ])
    .await;
    let session = session(&bridge, "dialer").await;
    let mut conn = tokio::time::timeout(Duration::from_secs(5), session.dial("peer.i2p:80"))
      .await
      .expect("Must not time out")
      .expect("Dial must succeed");
    assert_eq!(conn.remote_addr(), remote.address());
    assert_eq!(conn.local_addr(), session.addr());

    conn.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    conn.close().await.unwrap();
    conn.close().await.unwrap();

    let connect = &bridge.received(2).await[1];
    assert!(connect.ends_with(&format!("DESTINATION={} SILENT=false", remote.address())));
  }

  #[tokio::test]
  async fn unreachable_peer_is_reported() {
    let bridge = FakeBridge::spawn(vec![
      vec![hello(), create_step(), Step::Hold],
      vec![
        hello(),
        Step::reply("STREAM CONNECT", "STREAM STATUS RESULT=CANT_REACH_PEER\n"),
        Step::Hold,
      ],
    ])
    .await;
    let session = session(&bridge, "dialer").await;
    let target = sample_keys(3, SignatureType::EdDsaSha512Ed25519);
    let err = session
      .dial(target.address().as_str())
      .await
      .expect_err("Dial must fail");
    assert!(matches!(err, StreamError::CantReachPeer(_)));
  }

  #[tokio::test]
  async fn dial_context_deadline_and_cancellation() {
    let bridge = FakeBridge::spawn(vec![
      vec![hello(), create_step(), Step::Hold],
      // The bridge never answers the connect
      vec![hello(), Step::Hold],
      vec![hello(), Step::Hold],
    ])
    .await;
    let session = session(&bridge, "dialer").await;
    let target = sample_keys(3, SignatureType::EdDsaSha512Ed25519);
    let target = target.address().as_str();

    session.set_timeout(Some(Duration::from_millis(100)));
    let err = tokio::time::timeout(
      Duration::from_secs(5),
      session.dial_context(&DialContext::default(), target),
    )
    .await
    .expect("Session timeout must fire first")
    .expect_err("Dial must time out");
    assert!(matches!(err, StreamError::DeadlineExceeded));

    session.set_timeout(None);
    let context = DialContext::default();
    let cancel = context.cancel.clone();
    tokio::task::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      cancel.cancel();
    });
    let err = tokio::time::timeout(Duration::from_secs(5), session.dial_context(&context, target))
      .await
      .expect("Cancellation must fire first")
      .expect_err("Dial must be cancelled");
    assert!(matches!(err, StreamError::Cancelled));
  }

  #[tokio::test]
  async fn closed_session_refuses_dials() {
    let bridge = FakeBridge::spawn(vec![vec![hello(), create_step(), Step::Hold]]).await;
    let session = session(&bridge, "dialer").await;
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(session.is_closed());
    let err = session.dial("peer.i2p").await.expect_err("Session is closed");
    assert!(matches!(err, StreamError::Closed));
  }
}
