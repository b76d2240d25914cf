// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A PRIMARY session multiplexing stream and datagram sub-sessions
//!
//! Sub-sessions share the primary's destination and are added over its
//! keeper connection; each still opens its own data channel.

use std::{io, sync::Arc};

use futures::future::{BoxFuture, FutureExt};

use crate::{
  common::{
    destination::{Destination, DestinationKeys},
    protocol::{
      resolver::ResolveError,
      session::{add_session, SessionError, SessionRequest, SessionStyle},
    },
    session::{Session, SessionCore},
  },
  datagram::{self, DatagramConn, DatagramError, DatagramSession, RawSession},
  stream::{StreamConn, StreamError, StreamSession},
};

mod registry;

pub use registry::{routing_key, NetworkKind, SubSessionRegistry};

#[derive(thiserror::Error, Debug)]
pub enum PrimaryError {
  #[error("Unsupported network {0:?}; expected tcp, tcp4, tcp6, udp, udp4 or udp6")]
  UnsupportedNetwork(String),
  #[error("Primary session is closed")]
  Closed,
  #[error("Sub-session could not be added")]
  Session(#[from] SessionError),
  #[error("Stream sub-session failed")]
  Stream(#[from] StreamError),
  #[error("Datagram sub-session failed")]
  Datagram(#[from] DatagramError),
  #[error("Name resolution failed")]
  Resolve(#[from] ResolveError),
}

/// A sub-session cached by the dial registry
#[derive(Clone, Debug)]
pub enum SubSession {
  Stream(StreamSession),
  Datagram(DatagramSession),
}

impl SubSession {
  pub fn as_session(&self) -> &dyn Session {
    match self {
      SubSession::Stream(s) => s,
      SubSession::Datagram(d) => d,
    }
  }
}

/// The result of [PrimarySession::dial]
#[derive(Debug)]
pub enum PrimaryConn {
  Stream(StreamConn),
  Datagram(DatagramConn),
}

#[derive(Debug)]
struct PrimaryInner {
  core: SessionCore,
  registry: SubSessionRegistry,
}

/// Clones share the keeper and the sub-session registry
#[derive(Clone, Debug)]
pub struct PrimarySession {
  inner: Arc<PrimaryInner>,
}

impl PrimarySession {
  pub(crate) fn from_core(core: SessionCore) -> Self {
    Self {
      inner: Arc::new(PrimaryInner {
        core,
        registry: Default::default(),
      }),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.core.is_closed()
  }

  pub fn registry(&self) -> &SubSessionRegistry {
    &self.inner.registry
  }

  /// Sends `SESSION ADD` on the keeper and returns the new sub-session's state
  async fn add(
    &self,
    style: SessionStyle,
    id: &str,
    from_port: u16,
    to_port: u16,
    extras: &[String],
  ) -> Result<SessionCore, PrimaryError> {
    let core = &self.inner.core;
    if core.is_closed() {
      return Err(PrimaryError::Closed);
    }
    let mut request = SessionRequest::new(style, id);
    request.from_port = from_port;
    request.to_port = to_port;
    request.extras = extras;
    let added = {
      let mut keeper = core.keeper().lock().await;
      add_session(&mut keeper, &request)
        .await
        .map_err(|e| (e, keeper.is_closed()))
    };
    if let Err((e, keeper_closed)) = added {
      // A failed ADD leaves the keeper closed; the primary and its sub-sessions go with it
      if keeper_closed {
        tracing::warn!(primary = core.id(), id, "Keeper closed by failed sub-session add");
        let _ = self.close_all().await;
      }
      return Err(e.into());
    }
    tracing::info!(primary = core.id(), id, style = %style, "Sub-session added");
    Ok(core.sub_session(id.to_owned(), style, from_port, to_port))
  }

  pub async fn new_stream_sub_session(&self, id: &str) -> Result<StreamSession, PrimaryError> {
    self.new_stream_sub_session_with_ports(id, 0, 0).await
  }

  pub async fn new_stream_sub_session_with_ports(
    &self,
    id: &str,
    from_port: u16,
    to_port: u16,
  ) -> Result<StreamSession, PrimaryError> {
    let core = self
      .add(SessionStyle::Stream, id, from_port, to_port, &[])
      .await?;
    Ok(StreamSession::from_core(core))
  }

  /// `udp_port` is the bridge's UDP relay port; 0 selects the default
  pub async fn new_datagram_sub_session(
    &self,
    id: &str,
    udp_port: u32,
  ) -> Result<DatagramSession, PrimaryError> {
    let (socket, relay, extras) = self.prepare_channel(udp_port).await?;
    let core = self
      .add(SessionStyle::Datagram, id, 0, 0, &extras)
      .await?;
    Ok(DatagramSession::from_parts(core, socket, relay))
  }

  pub async fn new_raw_sub_session(&self, id: &str, udp_port: u32) -> Result<RawSession, PrimaryError> {
    let (socket, relay, extras) = self.prepare_channel(udp_port).await?;
    let core = self.add(SessionStyle::Raw, id, 0, 0, &extras).await?;
    Ok(RawSession::from_parts(core, socket, relay))
  }

  async fn prepare_channel(
    &self,
    udp_port: u32,
  ) -> Result<(tokio::net::UdpSocket, std::net::SocketAddr, Vec<String>), DatagramError> {
    let (local, peer) = {
      let keeper = self.inner.core.keeper().lock().await;
      (keeper.local_addr(), keeper.peer_addr())
    };
    datagram::prepare_channel(local, peer, udp_port).await
  }

  /// Dials `addr` through the sub-session cached for its routing key, creating it on first use
  ///
  /// tcp networks yield streams; udp networks yield datagram views bound to `addr`.
  #[tracing::instrument(level = "debug", skip(self), fields(primary = self.inner.core.id()), err)]
  pub async fn dial(&self, network: &str, addr: &str) -> Result<PrimaryConn, PrimaryError> {
    if self.is_closed() {
      return Err(PrimaryError::Closed);
    }
    let kind = NetworkKind::of(network)?;
    let key = routing_key(network, addr);
    let sub = self
      .inner
      .registry
      .get_or_create(&key, || async {
        Ok::<_, PrimaryError>(match kind {
          NetworkKind::Stream => SubSession::Stream(self.new_stream_sub_session(&key).await?),
          NetworkKind::Datagram => {
            SubSession::Datagram(self.new_datagram_sub_session(&key, 0).await?)
          }
        })
      })
      .await?;
    match sub {
      SubSession::Stream(stream) => Ok(PrimaryConn::Stream(stream.dial(addr).await?)),
      SubSession::Datagram(datagram) => Ok(PrimaryConn::Datagram(datagram.dial(addr).await?)),
    }
  }

  /// Resolves `name`, ignoring any `:port` suffix, over a dedicated connection
  pub async fn lookup(&self, name: &str) -> Result<Destination, PrimaryError> {
    let name = name.split(':').next().unwrap_or(name);
    Ok(self.inner.core.lookup(name).await?)
  }

  async fn close_all(&self) -> io::Result<()> {
    for sub in self.inner.registry.sessions() {
      let _ = sub.as_session().close().await;
    }
    self.inner.core.close().await
  }
}

impl Session for PrimarySession {
  fn id(&self) -> &str {
    self.inner.core.id()
  }

  fn style(&self) -> SessionStyle {
    self.inner.core.style()
  }

  fn keys(&self) -> &DestinationKeys {
    self.inner.core.keys()
  }

  /// Closes every cached sub-session, then the keeper
  fn close(&self) -> BoxFuture<'_, io::Result<()>> {
    self.close_all().boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{PrimaryConn, PrimaryError, PrimarySession};
  use crate::{
    common::{
      destination::{tests::sample_keys, SignatureType},
      protocol::session::{SessionError, SessionStyle},
      sam::Sam,
      session::Session,
    },
    util::test_bridge::{hello, FakeBridge, Step},
  };

  fn primary_script(mut tail: Vec<Step>) -> Vec<Step> {
    let keys = sample_keys(30, SignatureType::EdDsaSha512Ed25519);
    let mut steps = vec![
      hello(),
      Step::reply(
        "SESSION CREATE STYLE=PRIMARY ID=main",
        &format!("SESSION STATUS RESULT=OK DESTINATION={}\n", keys.private_key()),
      ),
    ];
    steps.append(&mut tail);
    steps.push(Step::Hold);
    steps
  }

  async fn primary(bridge: &FakeBridge) -> PrimarySession {
    let mut config = bridge.config();
    config.set_tunnel_name("main");
    config.destination_keys = Some(sample_keys(30, SignatureType::EdDsaSha512Ed25519));
    let sam = Sam::connect(config).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), sam.new_primary_session())
      .await
      .expect("Must not time out")
      .expect("Primary session")
  }

  fn add_ok(expect: &str) -> Step {
    Step::reply(expect, "SESSION STATUS RESULT=OK ID=sub MESSAGE=ADD\n")
  }

  #[tokio::test]
  async fn sub_sessions_are_added_on_the_keeper() {
    let bridge = FakeBridge::spawn(vec![primary_script(vec![
      add_ok("SESSION ADD STYLE=STREAM ID=web FROM_PORT=8080 TO_PORT=80"),
      add_ok("SESSION ADD STYLE=DATAGRAM ID=dns PORT="),
      add_ok("SESSION ADD STYLE=STREAM ID=web2"),
    ])])
    .await;
    let primary = primary(&bridge).await;

    let web = primary
      .new_stream_sub_session_with_ports("web", 8080, 80)
      .await
      .unwrap();
    assert_eq!(web.id(), "web");
    assert_eq!(web.addr(), primary.addr());
    assert_eq!((web.from_port(), web.to_port()), (8080, 80));

    let dns = primary.new_datagram_sub_session("dns", 0).await.unwrap();
    assert_eq!(dns.style(), SessionStyle::Datagram);
    assert_eq!(dns.relay_addr().port(), 7655);

    // Closing a sub-session leaves the primary's keeper usable
    web.close().await.unwrap();
    assert!(web.is_closed());
    primary.new_stream_sub_session("web2").await.unwrap();
    assert_eq!(bridge.connection_count().await, 1);

    primary.close().await.unwrap();
    assert!(primary.is_closed());
    assert!(dns.is_closed());
    assert!(matches!(
      primary.new_stream_sub_session("late").await,
      Err(PrimaryError::Closed)
    ));
  }

  #[tokio::test]
  async fn dials_sharing_a_prefix_share_a_sub_session() {
    let bridge = FakeBridge::spawn(vec![
      primary_script(vec![
        add_ok("SESSION ADD STYLE=STREAM ID=tcpAAAA"),
        add_ok("SESSION ADD STYLE=DATAGRAM ID=udpAAAA PORT="),
      ]),
      vec![
        hello(),
        Step::reply("STREAM CONNECT ID=tcpAAAA DESTINATION=AAAAfirst", "STREAM STATUS RESULT=OK\n"),
        Step::Hold,
      ],
      vec![
        hello(),
        Step::reply("STREAM CONNECT ID=tcpAAAA DESTINATION=AAAAsecond", "STREAM STATUS RESULT=OK\n"),
        Step::Hold,
      ],
    ])
    .await;
    let primary = primary(&bridge).await;

    let first = primary.dial("tcp", "AAAAfirst").await.unwrap();
    assert!(matches!(&first, PrimaryConn::Stream(c) if c.remote_addr().as_str() == "AAAAfirst"));
    let second = primary.dial("tcp", "AAAAsecond").await.unwrap();
    assert!(matches!(&second, PrimaryConn::Stream(c) if c.remote_addr().as_str() == "AAAAsecond"));
    assert_eq!(primary.registry().len(), 1);

    let datagram = primary.dial("udp", "AAAAthird").await.unwrap();
    assert!(matches!(&datagram, PrimaryConn::Datagram(c) if c.remote_addr().as_str() == "AAAAthird"));
    assert_eq!(primary.registry().len(), 2);

    let adds: Vec<String> = bridge
      .received(0)
      .await
      .into_iter()
      .filter(|line| line.starts_with("SESSION ADD"))
      .collect();
    assert_eq!(adds.len(), 2);

    assert!(matches!(
      primary.dial("unix", "AAAA").await,
      Err(PrimaryError::UnsupportedNetwork(_))
    ));
  }

  #[tokio::test]
  async fn concurrent_dials_create_one_sub_session() {
    let bridge = FakeBridge::spawn(vec![
      primary_script(vec![add_ok("SESSION ADD STYLE=STREAM ID=tcpBBBB")]),
      vec![hello(), Step::reply("STREAM CONNECT", "STREAM STATUS RESULT=OK\n"), Step::Hold],
      vec![hello(), Step::reply("STREAM CONNECT", "STREAM STATUS RESULT=OK\n"), Step::Hold],
    ])
    .await;
    let primary = primary(&bridge).await;
    let (a, b) = tokio::join!(primary.dial("tcp", "BBBBone"), primary.dial("tcp", "BBBBtwo"));
    a.unwrap();
    b.unwrap();
    assert_eq!(primary.registry().len(), 1);
  }

  #[tokio::test]
  async fn rejected_add_closes_the_primary() {
    let bridge = FakeBridge::spawn(vec![primary_script(vec![
      add_ok("SESSION ADD STYLE=STREAM ID=web"),
      Step::reply("SESSION ADD", "SESSION STATUS RESULT=DUPLICATED_ID\n"),
    ])])
    .await;
    let primary = primary(&bridge).await;
    let web = primary.new_stream_sub_session("web").await.unwrap();
    let err = primary
      .new_stream_sub_session("main")
      .await
      .expect_err("Id is taken");
    assert!(matches!(err, PrimaryError::Session(SessionError::DuplicateId)));

    assert!(primary.is_closed());
    assert!(web.is_closed());
    assert!(matches!(
      primary.new_stream_sub_session("again").await,
      Err(PrimaryError::Closed)
    ));
    assert!(matches!(
      primary.dial("tcp", "AAAAfirst").await,
      Err(PrimaryError::Closed)
    ));
  }
}
