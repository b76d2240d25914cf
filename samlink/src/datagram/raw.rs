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

/// A RAW-style session: anonymous datagrams with no sender attached
#[derive(Clone, Debug)]
pub struct RawSession {
  channel: Arc<PacketChannel>,
}

impl RawSession {
  pub(crate) fn from_parts(core: SessionCore, socket: UdpSocket, relay: SocketAddr) -> Self {
    Self {
      channel: Arc::new(PacketChannel::new(core, socket, relay)),
    }
  }

  /// Sends one datagram, returning the payload length
  pub async fn write_to(&self, payload: &[u8], destination: &Destination) -> Result<usize, DatagramError> {
    self.channel.send(destination.as_str(), payload).await
  }

  /// Receives one datagram's payload
  pub async fn read(&self, buf: &mut [u8]) -> Result<usize, DatagramError> {
    self.channel.recv(buf).await
  }

  pub async fn lookup(&self, name: &str) -> Result<Destination, DatagramError> {
    Ok(self.channel.core().lookup(name).await?)
  }

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

impl Session for RawSession {
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

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use crate::{
    common::{
      destination::{tests::sample_keys, SignatureType},
      protocol::session::SessionStyle,
      sam::Sam,
      session::Session,
    },
    util::test_bridge::{hello, FakeBridge, FakeRelay, Step},
  };

  #[tokio::test]
  async fn raw_payloads_arrive_bare() {
    let keys = sample_keys(20, SignatureType::EdDsaSha512Ed25519);
    let create = format!("SESSION STATUS RESULT=OK DESTINATION={}\n", keys.private_key());
    let bridge = FakeBridge::spawn(vec![vec![
      hello(),
      Step::reply("SESSION CREATE STYLE=RAW", &create),
      Step::Hold,
    ]])
    .await;
    let relay = FakeRelay::spawn(None).await;
    let mut config = bridge.config();
    config.set_tunnel_name("raw");
    config.destination_keys = Some(keys.clone());
    let session = Sam::connect(config)
      .await
      .unwrap()
      .new_raw_session(relay.addr.port() as u32)
      .await
      .expect("Raw session");
    assert_eq!(session.style(), SessionStyle::Raw);
    assert_eq!(session.relay_addr(), relay.addr);

    let written = session.write_to(b"line\nwith newline", keys.address()).await.unwrap();
    assert_eq!(written, 17);
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), session.read(&mut buf))
      .await
      .expect("Reflected datagram must arrive")
      .unwrap();
    assert_eq!(&buf[..n], b"line\nwith newline");
    assert_eq!(relay.headers().await, vec![format!("3.1 raw {}", keys.address())]);
    session.close().await.unwrap();
  }
}
