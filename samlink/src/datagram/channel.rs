// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  future::Future,
  io,
  net::SocketAddr,
  sync::{Arc, Mutex, PoisonError},
};

use tokio::{net::UdpSocket, time::Instant};
use tokio_util::sync::CancellationToken;

use super::DatagramError;
use crate::common::{destination::Destination, session::SessionCore};

/// Room for the header the relay puts in front of inbound payloads
const HEADER_ALLOWANCE: usize = 4096;

#[derive(Copy, Clone, Debug, Default)]
struct Deadlines {
  read: Option<Instant>,
  write: Option<Instant>,
}

/// A session plus the UDP socket and relay address its packets move through
#[derive(Debug)]
pub(super) struct PacketChannel {
  core: SessionCore,
  /// Taken on close so the port is released even while clones remain
  socket: Mutex<Option<Arc<UdpSocket>>>,
  relay: SocketAddr,
  deadlines: Mutex<Deadlines>,
  shutdown: CancellationToken,
}

/// Relay packets are only trusted by source IP; the port is not checked
pub(super) fn from_relay(relay: SocketAddr, source: SocketAddr) -> bool {
  relay.ip() == source.ip()
}

/// Locates the payload of a repliable datagram and the sender named in its header line
pub(super) fn split_datagram(packet: &[u8]) -> Option<(usize, &str)> {
  let newline = packet.iter().position(|b| *b == b'\n')?;
  let header = std::str::from_utf8(&packet[..newline]).ok()?;
  let sender = header.split_whitespace().next()?;
  Some((newline + 1, sender))
}

impl PacketChannel {
  pub(super) fn new(core: SessionCore, socket: UdpSocket, relay: SocketAddr) -> Self {
    let shutdown = core.shutdown().clone();
    Self {
      core,
      socket: Mutex::new(Some(Arc::new(socket))),
      relay,
      deadlines: Default::default(),
      shutdown,
    }
  }

  pub(super) fn core(&self) -> &SessionCore {
    &self.core
  }

  pub(super) fn relay(&self) -> SocketAddr {
    self.relay
  }

  /// The bound socket, or [DatagramError::Closed] once the channel has closed
  fn socket(&self) -> Result<Arc<UdpSocket>, DatagramError> {
    self
      .socket
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
      .ok_or(DatagramError::Closed)
  }

  pub(super) fn local_addr(&self) -> io::Result<SocketAddr> {
    match self.socket() {
      Ok(socket) => socket.local_addr(),
      Err(_) => Err(io::ErrorKind::NotConnected.into()),
    }
  }

  fn deadlines(&self) -> std::sync::MutexGuard<'_, Deadlines> {
    self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(super) fn set_read_deadline(&self, deadline: Option<Instant>) {
    self.deadlines().read = deadline;
  }

  pub(super) fn set_write_deadline(&self, deadline: Option<Instant>) {
    self.deadlines().write = deadline;
  }

  /// Runs `operation` until the deadline passes or the channel closes
  async fn bounded<T, F>(&self, deadline: Option<Instant>, operation: F) -> Result<T, DatagramError>
  where
    F: Future<Output = Result<T, DatagramError>>,
  {
    if self.shutdown.is_cancelled() {
      return Err(DatagramError::Closed);
    }
    let bounded = async {
      match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, operation)
          .await
          .map_err(|_| DatagramError::DeadlineExceeded)?,
        None => operation.await,
      }
    };
    tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => Err(DatagramError::Closed),
      res = bounded => res,
    }
  }

  /// Sends `payload` to `destination` through the relay, returning the payload length
  pub(super) async fn send(&self, destination: &str, payload: &[u8]) -> Result<usize, DatagramError> {
    let header = format!(
      "{} {} {}\n",
      self.core.version(),
      self.core.id(),
      destination
    );
    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    let deadline = self.deadlines().write;
    let socket = self.socket()?;
    self
      .bounded(deadline, async {
        socket.send_to(&packet, self.relay).await?;
        Ok::<_, DatagramError>(payload.len())
      })
      .await
  }

  /// Receives the next repliable datagram and its sender
  pub(super) async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), DatagramError> {
    self
      .recv_with(buf, |packet| match split_datagram(packet) {
        Some((start, sender)) => Ok(Some((start, Destination::new(sender)?))),
        None => Ok(None),
      })
      .await
  }

  /// Receives the next raw datagram, which carries no header
  pub(super) async fn recv(&self, buf: &mut [u8]) -> Result<usize, DatagramError> {
    let (n, ()) = self.recv_with(buf, |_| Ok(Some((0, ())))).await?;
    Ok(n)
  }

  /// Receives relayed packets into `buf` until `parse` accepts one
  ///
  /// `parse` yields the payload offset, or `None` to drop the packet. Packets
  /// from other hosts are dropped. A payload longer than `buf` is truncated
  /// to fit and reported as [DatagramError::BufferTooSmall].
  async fn recv_with<T, P>(&self, buf: &mut [u8], parse: P) -> Result<(usize, T), DatagramError>
  where
    P: Fn(&[u8]) -> Result<Option<(usize, T)>, DatagramError>,
  {
    let deadline = self.deadlines().read;
    let socket = self.socket()?;
    self
      .bounded(deadline, async {
        let mut packet = vec![0u8; buf.len() + HEADER_ALLOWANCE];
        loop {
          let (received, source) = socket.recv_from(&mut packet).await?;
          if !from_relay(self.relay, source) {
            tracing::warn!(source = %source, relay = %self.relay, "Dropping datagram from unexpected host");
            continue;
          }
          let packet = &packet[..received];
          let (start, parsed) = match parse(packet)? {
            Some(parts) => parts,
            None => {
              tracing::warn!(source = %source, "Dropping datagram without a header line");
              continue;
            }
          };
          let payload = &packet[start..];
          let copied = payload.len().min(buf.len());
          buf[..copied].copy_from_slice(&payload[..copied]);
          if copied < payload.len() {
            return Err(DatagramError::BufferTooSmall {
              needed: payload.len(),
              available: buf.len(),
            });
          }
          return Ok((copied, parsed));
        }
      })
      .await
  }

  /// Closes the session's keeper, then releases the UDP socket
  ///
  /// Pending I/O ends with [DatagramError::Closed]. A keeper failure is
  /// returned; the socket is released regardless.
  pub(super) async fn close(&self) -> io::Result<()> {
    let closed = self.core.close().await;
    let socket = self
      .socket
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    drop(socket);
    closed
  }
}

#[cfg(test)]
mod tests {
  use super::{from_relay, split_datagram};

  #[test]
  fn relay_filter_checks_ip_only() {
    let relay = "127.0.0.1:7655".parse().unwrap();
    assert!(from_relay(relay, "127.0.0.1:40000".parse().unwrap()));
    assert!(!from_relay(relay, "10.1.1.1:7655".parse().unwrap()));
  }

  #[test]
  fn packets_split_on_first_newline() {
    let packet = b"AAAA FROM_PORT=0 TO_PORT=0\nline1\nline2";
    let (start, sender) = split_datagram(packet).unwrap();
    assert_eq!(&packet[start..], b"line1\nline2");
    assert_eq!(sender, "AAAA");
    assert_eq!(split_datagram(b"AAAA\n"), Some((5, "AAAA")));
    assert!(split_datagram(b"no header").is_none());
    assert!(split_datagram(b"\npayload").is_none());
  }
}
