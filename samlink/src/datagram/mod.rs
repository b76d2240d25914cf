// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Repliable (DATAGRAM) and anonymous (RAW) datagrams relayed over UDP
//!
//! Outbound packets go to the bridge's UDP relay prefixed with a
//! `<version> <id> <destination>\n` header. Inbound packets arrive on a
//! local socket whose port is announced at session creation.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::common::{
  destination::DestinationError,
  protocol::{resolver::ResolveError, session::SessionError, DEFAULT_UDP_PORT},
};

mod channel;
mod raw;
mod session;

pub use raw::RawSession;
pub use session::{DatagramConn, DatagramSession};

/// Largest payload the overlay delivers; larger datagrams are not rejected locally
pub const MAX_DATAGRAM_PAYLOAD: usize = 31 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum DatagramError {
  #[error("UDP port {0} is outside 0-65535")]
  InvalidPort(u32),
  #[error("Datagram of {needed} bytes truncated to a {available} byte buffer")]
  BufferTooSmall { needed: usize, available: usize },
  #[error("Datagram deadline exceeded")]
  DeadlineExceeded,
  #[error("Session is closed")]
  Closed,
  #[error("Malformed destination")]
  Destination(#[from] DestinationError),
  #[error("Name resolution failed")]
  Resolve(#[from] ResolveError),
  #[error("Session establishment failed")]
  Session(#[from] SessionError),
  #[error("UDP I/O failed")]
  Io(#[from] std::io::Error),
}

/// Binds the local socket and locates the relay for a new datagram or raw session
///
/// The socket binds to the same local address as the control connection
/// (`control_local`), and the relay lives on the bridge host. Returns the
/// socket, the relay address, and the extra session option announcing the
/// socket's port.
pub(crate) async fn prepare_channel(
  control_local: SocketAddr,
  control_peer: SocketAddr,
  udp_port: u32,
) -> Result<(UdpSocket, SocketAddr, Vec<String>), DatagramError> {
  let relay_port = match u16::try_from(udp_port) {
    Ok(0) => DEFAULT_UDP_PORT,
    Ok(port) => port,
    Err(_) => return Err(DatagramError::InvalidPort(udp_port)),
  };
  let socket = UdpSocket::bind(SocketAddr::new(control_local.ip(), 0)).await?;
  let relay = SocketAddr::new(control_peer.ip(), relay_port);
  let extras = vec![format!("PORT={}", socket.local_addr()?.port())];
  tracing::debug!(local = ?socket.local_addr(), relay = %relay, "Bound datagram socket");
  Ok((socket, relay, extras))
}
