// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io, net::SocketAddr, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use tokio::{net::UdpSocket, time::Instant};

use super::{channel::PacketChannel, DatagramError};
use crate::common::{
  destination::{Destination, DestinationKeys},
  protocol::session::SessionStyle,
  session::{Session, SessionCore},
};

/// A DATAGRAM-style session: authenticated, repliable datagrams
///
/// Clones share one socket and one tunnel.
#[derive(Clone, Debug)]
pub struct DatagramSession {
  channel: Arc<PacketChannel>,
}

impl DatagramSession {
  pub(crate) fn from_parts(core: SessionCore, socket: UdpSocket, relay: SocketAddr) -> Self {
    Self {
      channel: Arc::new(PacketChannel::new(core, socket, relay)),
    }
  }

  /// Sends one datagram, returning the payload length
  pub async fn write_to(&self, payload: &[u8], destination: &Destination) -> Result<usize, DatagramError> {
    self.channel.send(destination.as_str(), payload).await
  }

  /// Receives one datagram and the destination that sent it
  pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), DatagramError> {
    self.channel.recv_from(buf).await
  }

  /// Resolves `addr` (`host[:port]`) and returns a view bound to it
  pub async fn dial(&self, addr: &str) -> Result<DatagramConn, DatagramError> {
    let host = addr.split(':').next().unwrap_or(addr);
    let remote = if Destination::is_name(host) {
      self.lookup(host).await?
    } else {
      Destination::new(host)?
    };
    Ok(DatagramConn {
      session: self.clone(),
      remote,
    })
  }

  pub async fn lookup(&self, name: &str) -> Result<Destination, DatagramError> {
    Ok(self.channel.core().lookup(name).await?)
  }

  /// The local UDP socket the relay delivers to
  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.channel.local_addr()
  }

  pub fn relay_addr(&self) -> SocketAddr {
    self.channel.relay()
  }

  pub fn set_deadline(&self, deadline: Option<Instant>) {
    self.channel.set_read_deadline(deadline);
    self.channel.set_write_deadline(deadline);
  }

  pub fn set_read_deadline(&self, deadline: Option<Instant>) {
    self.channel.set_read_deadline(deadline);
  }

  pub fn set_write_deadline(&self, deadline: Option<Instant>) {
    self.channel.set_write_deadline(deadline);
  }

  pub fn is_closed(&self) -> bool {
    self.channel.core().is_closed()
  }
}

impl Session for DatagramSession {
  fn id(&self) -> &str {
    self.channel.core().id()
  }

  fn style(&self) -> SessionStyle {
    self.channel.core().style()
  }

  fn keys(&self) -> &DestinationKeys {
    self.channel.core().keys()
  }

  fn close(&self) -> BoxFuture<'_, io::Result<()>> {
    self.channel.close().boxed()
  }
}

/// A datagram session paired with a fixed remote destination
#[derive(Clone, Debug)]
pub struct DatagramConn {
  session: DatagramSession,
  remote: Destination,
}

impl DatagramConn {
  pub fn session(&self) -> &DatagramSession {
    &self.session
  }

  pub fn local_addr(&self) -> &Destination {
    self.session.addr()
  }

  pub fn remote_addr(&self) -> &Destination {
    &self.remote
  }

  /// Sends one datagram to the remote destination
  pub async fn write(&self, payload: &[u8]) -> Result<usize, DatagramError> {
    self.session.write_to(payload, &self.remote).await
  }

  /// Receives the next datagram from any sender
  pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), DatagramError> {
    self.session.read_from(buf).await
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::time::Instant;

  use crate::{
    common::{
      destination::{tests::sample_keys, DestinationKeys, SignatureType},
      sam::Sam,
      session::Session,
    },
    datagram::{DatagramError, DatagramSession, MAX_DATAGRAM_PAYLOAD},
    util::test_bridge::{hello, FakeBridge, FakeRelay, Step},
  };

  async fn datagram_session(
    keys: &DestinationKeys,
    relay: &FakeRelay,
  ) -> (FakeBridge, DatagramSession) {
    let create = format!("SESSION STATUS RESULT=OK DESTINATION={}\n", keys.private_key());
    let bridge = FakeBridge::spawn(vec![vec![
      hello(),
      Step::reply("SESSION CREATE STYLE=DATAGRAM", &create),
      Step::Hold,
    ]])
    .await;
    let mut config = bridge.config();
    config.set_tunnel_name("dgram");
    config.destination_keys = Some(keys.clone());
    let session = Sam::connect(config)
      .await
      .unwrap()
      .new_datagram_session(relay.addr.port() as u32)
      .await
      .expect("Datagram session");
    (bridge, session)
  }

  #[tokio::test]
  async fn datagrams_round_trip_through_relay() {
    let keys = sample_keys(12, SignatureType::EdDsaSha512Ed25519);
    let sender = sample_keys(13, SignatureType::EdDsaSha512Ed25519);
    let relay = FakeRelay::spawn(Some(sender.address().to_string())).await;
    let (bridge, session) = datagram_session(&keys, &relay).await;

    let create = &bridge.received(0).await[1];
    let port = session.local_addr().unwrap().port();
    assert!(create.ends_with(&format!("PORT={}", port)), "{}", create);

    for size in [0, 1, 1500, MAX_DATAGRAM_PAYLOAD] {
      let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
      let written = session.write_to(&payload, keys.address()).await.unwrap();
      assert_eq!(written, size);
      let mut buf = vec![0u8; MAX_DATAGRAM_PAYLOAD];
      let (n, from) = tokio::time::timeout(Duration::from_secs(5), session.read_from(&mut buf))
        .await
        .expect("Reflected datagram must arrive")
        .unwrap();
      assert_eq!(&buf[..n], payload.as_slice());
      assert_eq!(&from, sender.address());
    }
    let headers = relay.headers().await;
    assert_eq!(headers[0], format!("3.1 dgram {}", keys.address()));
  }

  #[tokio::test]
  async fn short_buffers_are_reported() {
    let keys = sample_keys(14, SignatureType::EdDsaSha512Ed25519);
    let relay = FakeRelay::spawn(Some(keys.address().to_string())).await;
    let (_bridge, session) = datagram_session(&keys, &relay).await;
    session.write_to(b"0123456789", keys.address()).await.unwrap();
    let mut buf = [0u8; 4];
    let err = tokio::time::timeout(Duration::from_secs(5), session.read_from(&mut buf))
      .await
      .unwrap()
      .expect_err("Buffer is too small");
    assert!(matches!(
      err,
      DatagramError::BufferTooSmall {
        needed: 10,
        available: 4
      }
    ));
    assert_eq!(&buf, b"0123");
  }

  #[tokio::test]
  async fn deadlines_and_close_end_reads() {
    let keys = sample_keys(15, SignatureType::EdDsaSha512Ed25519);
    // The relay never answers
    let relay = FakeRelay::spawn(None).await;
    let (_bridge, session) = datagram_session(&keys, &relay).await;
    let mut buf = [0u8; 16];

    session.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
    let err = session.read_from(&mut buf).await.expect_err("Deadline passes");
    assert!(matches!(err, DatagramError::DeadlineExceeded));

    session.set_read_deadline(None);
    let reader = session.clone();
    let pending = tokio::task::spawn(async move {
      let mut buf = [0u8; 16];
      reader.read_from(&mut buf).await.map(|(n, _)| n)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.close().await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), pending)
      .await
      .unwrap()
      .unwrap()
      .expect_err("Close ends the read");
    assert!(matches!(err, DatagramError::Closed));
    assert!(session.is_closed());
    assert!(matches!(
      session.write_to(b"x", keys.address()).await,
      Err(DatagramError::Closed)
    ));
  }

  #[tokio::test]
  async fn close_releases_the_socket() {
    let keys = sample_keys(18, SignatureType::EdDsaSha512Ed25519);
    let relay = FakeRelay::spawn(None).await;
    let (_bridge, session) = datagram_session(&keys, &relay).await;
    let local = session.local_addr().unwrap();
    let clone = session.clone();

    session.close().await.unwrap();
    assert!(clone.local_addr().is_err());
    let rebound = tokio::net::UdpSocket::bind(local)
      .await
      .expect("Port is free once the session closes");
    drop(rebound);
    assert!(matches!(
      clone.read_from(&mut [0u8; 8]).await,
      Err(DatagramError::Closed)
    ));
    session.close().await.expect("Second close is a no-op");
  }

  #[tokio::test]
  async fn datagrams_from_other_hosts_are_dropped() {
    let keys = sample_keys(19, SignatureType::EdDsaSha512Ed25519);
    let sender = sample_keys(20, SignatureType::EdDsaSha512Ed25519);
    let relay = FakeRelay::spawn(Some(sender.address().to_string())).await;
    let (_bridge, session) = datagram_session(&keys, &relay).await;
    let local = session.local_addr().unwrap();

    let spoofer = tokio::net::UdpSocket::bind("127.0.0.2:0").await.unwrap();
    let spoofed = format!("{}\nspoofed", sender.address());
    spoofer.send_to(spoofed.as_bytes(), local).await.unwrap();
    session.write_to(b"genuine", keys.address()).await.unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), session.read_from(&mut buf))
      .await
      .expect("Relayed datagram must arrive")
      .unwrap();
    assert_eq!(&buf[..n], b"genuine");
    assert_eq!(&from, sender.address());

    session.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
    assert!(matches!(
      session.read_from(&mut buf).await,
      Err(DatagramError::DeadlineExceeded)
    ));
  }

  #[tokio::test]
  async fn dial_binds_remote_destination() {
    let keys = sample_keys(16, SignatureType::EdDsaSha512Ed25519);
    let peer = sample_keys(17, SignatureType::EdDsaSha512Ed25519);
    let relay = FakeRelay::spawn(Some(peer.address().to_string())).await;
    let (_bridge, session) = datagram_session(&keys, &relay).await;
    let conn = session
      .dial(&format!("{}:0", peer.address()))
      .await
      .unwrap();
    assert_eq!(conn.remote_addr(), peer.address());
    assert_eq!(conn.local_addr(), keys.address());
    conn.write(b"hi").await.unwrap();
    let mut buf = [0u8; 8];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), conn.read_from(&mut buf))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buf[..n], b"hi");
    assert_eq!(&from, peer.address());
    assert_eq!(
      relay.headers().await,
      vec![format!("3.1 dgram {}", peer.address())]
    );
  }
}
