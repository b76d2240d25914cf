// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
  net::TcpStream,
  time::Instant,
};

use crate::{common::destination::Destination, util::deadline::Timed};

/// An established stream; the control connection it was negotiated on carries its bytes
#[derive(Debug)]
pub struct StreamConn {
  stream: Timed<BufReader<TcpStream>>,
  local: Destination,
  remote: Destination,
  from_port: u16,
  to_port: u16,
  closed: bool,
}

impl StreamConn {
  pub(crate) fn new(stream: BufReader<TcpStream>, local: Destination, remote: Destination) -> Self {
    Self {
      stream: Timed::new(stream),
      local,
      remote,
      from_port: 0,
      to_port: 0,
      closed: false,
    }
  }

  pub(crate) fn with_ports(mut self, from_port: u16, to_port: u16) -> Self {
    self.from_port = from_port;
    self.to_port = to_port;
    self
  }

  pub fn local_addr(&self) -> &Destination {
    &self.local
  }

  pub fn remote_addr(&self) -> &Destination {
    &self.remote
  }

  /// Port the peer sent from, when the bridge reported one
  pub fn from_port(&self) -> u16 {
    self.from_port
  }

  pub fn to_port(&self) -> u16 {
    self.to_port
  }

  pub fn set_deadline(&mut self, deadline: Option<Instant>) {
    self.stream.set_deadline(deadline);
  }

  pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
    self.stream.set_read_deadline(deadline);
  }

  pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
    self.stream.set_write_deadline(deadline);
  }

  /// Ends the stream at the bridge; repeated calls are no-ops
  pub async fn close(&mut self) -> io::Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    match self.stream.get_mut().get_mut().shutdown().await {
      Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
      _ => Ok(()),
    }
  }
}

impl AsyncRead for StreamConn {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.stream).poll_read(cx, buf)
  }
}

impl AsyncWrite for StreamConn {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.stream).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.stream).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.stream).poll_shutdown(cx)
  }
}
