// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! TCP control connections to the bridge and the HELLO version handshake

use std::{io, net::SocketAddr};

use tokio::{
  io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
  net::TcpStream,
};

use super::{
  reply_value, SamVersion, HELLO_NO_VERSION, HELLO_OK, MAX_HELLO_LENGTH, MAX_REPLY_LENGTH,
  MAX_WRITE_ATTEMPTS,
};

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
  #[error("Failed to connect to the bridge at {address}")]
  Connect {
    address: String,
    #[source]
    source: io::Error,
  },
  #[error("Handshake with the bridge failed")]
  Handshake(#[from] HandshakeError),
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("Bridge supports none of the protocol versions {min} to {max}")]
  NoVersion { min: SamVersion, max: SamVersion },
  #[error("Unrecognized handshake reply {0:?}")]
  Unrecognized(String),
  #[error("Handshake command failed")]
  Command(#[from] CommandError),
}

/// Failures moving a single command or reply over a control connection
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
  #[error("Command write incomplete after {attempts} attempts")]
  WriteFailed { attempts: usize },
  #[error("Control connection already closed")]
  Closed,
  #[error("Bridge closed the control connection")]
  UnexpectedEof,
  #[error("Reply exceeded {0} bytes without a line terminator")]
  ReplyTooLong(u64),
  #[error("Control connection I/O failed")]
  Io(#[from] io::Error),
}

/// A handshaked line-protocol connection to the bridge
///
/// Not internally synchronized; one logical operation at a time.
#[derive(Debug)]
pub struct ControlConnection {
  stream: BufReader<TcpStream>,
  local_addr: SocketAddr,
  peer_addr: SocketAddr,
  version: SamVersion,
  closed: bool,
}

impl ControlConnection {
  /// Connects to `address` and negotiates a version within `min..=max`
  #[tracing::instrument(level = "debug", err)]
  pub async fn connect(
    address: &str,
    min: SamVersion,
    max: SamVersion,
  ) -> Result<Self, ConnectError> {
    let connect_error = |source| ConnectError::Connect {
      address: address.to_owned(),
      source,
    };
    let stream = TcpStream::connect(address).await.map_err(connect_error)?;
    let local_addr = stream.local_addr().map_err(connect_error)?;
    let peer_addr = stream.peer_addr().map_err(connect_error)?;
    let mut connection = Self {
      stream: BufReader::new(stream),
      local_addr,
      peer_addr,
      version: max,
      closed: false,
    };
    connection.version = connection.hello(min, max).await?;
    tracing::debug!(version = %connection.version, peer = %peer_addr, "Bridge handshake complete");
    Ok(connection)
  }

  async fn hello(&mut self, min: SamVersion, max: SamVersion) -> Result<SamVersion, HandshakeError> {
    self
      .send_command(&format!("HELLO VERSION MIN={} MAX={} \n", min, max))
      .await?;
    let reply = self.read_line(MAX_HELLO_LENGTH).await?;
    match parse_hello_reply(&reply, min, max) {
      Ok(version) => Ok(version),
      Err(e) => {
        let _ = self.close().await;
        Err(e)
      }
    }
  }

  pub fn version(&self) -> SamVersion {
    self.version
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }

  /// Writes a complete command, retrying partial writes a bounded number of times
  ///
  /// Any failure closes the connection.
  pub async fn send_command(&mut self, command: &str) -> Result<(), CommandError> {
    if self.closed {
      return Err(CommandError::Closed);
    }
    tracing::debug!(command = %loggable(command), "Sending bridge command");
    let written = write_bounded(self.stream.get_mut(), command.as_bytes()).await;
    if written.is_err() {
      let _ = self.close().await;
    }
    written
  }

  /// Reads one reply line, without its terminator
  pub async fn read_reply(&mut self) -> Result<String, CommandError> {
    self.read_line(MAX_REPLY_LENGTH).await
  }

  /// Sends a command and reads the single-line reply
  pub async fn command(&mut self, command: &str) -> Result<String, CommandError> {
    self.send_command(command).await?;
    self.read_reply().await
  }

  async fn read_line(&mut self, limit: u64) -> Result<String, CommandError> {
    if self.closed {
      return Err(CommandError::Closed);
    }
    let reply = match read_bounded_line(&mut self.stream, limit).await {
      Ok(reply) => reply,
      Err(e) => {
        let _ = self.close().await;
        return Err(e);
      }
    };
    tracing::debug!(reply = %loggable(&reply), "Received bridge reply");
    Ok(reply)
  }

  /// Shuts the connection down; repeated calls are no-ops
  pub async fn close(&mut self) -> io::Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    match self.stream.get_mut().shutdown().await {
      Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
      _ => Ok(()),
    }
  }

  /// Surrenders the socket for use as a data channel, keeping any bytes already buffered
  pub fn into_stream(self) -> BufReader<TcpStream> {
    self.stream
  }
}

/// Writes all of `bytes`, giving up after [MAX_WRITE_ATTEMPTS] write calls
async fn write_bounded<W>(writer: &mut W, bytes: &[u8]) -> Result<(), CommandError>
where
  W: AsyncWrite + Unpin,
{
  let mut written = 0;
  let mut attempts = 0;
  while written < bytes.len() {
    if attempts == MAX_WRITE_ATTEMPTS {
      return Err(CommandError::WriteFailed { attempts });
    }
    attempts += 1;
    written += writer.write(&bytes[written..]).await?;
  }
  Ok(())
}

/// Reads one line of at most `limit` bytes, stripping its terminator
///
/// A final line cut short by EOF is returned as is.
async fn read_bounded_line<R>(reader: &mut R, limit: u64) -> Result<String, CommandError>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = reader.take(limit).read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(CommandError::UnexpectedEof);
  }
  if line.last() != Some(&b'\n') && n as u64 >= limit {
    return Err(CommandError::ReplyTooLong(limit));
  }
  Ok(
    String::from_utf8_lossy(&line)
      .trim_end_matches(['\r', '\n'])
      .to_owned(),
  )
}

/// Classifies a HELLO reply into the negotiated version
pub fn parse_hello_reply(
  reply: &str,
  min: SamVersion,
  max: SamVersion,
) -> Result<SamVersion, HandshakeError> {
  if reply.contains(HELLO_OK) {
    Ok(
      reply_value(reply, "VERSION")
        .and_then(|v| v.parse().ok())
        .unwrap_or(max),
    )
  } else if reply.contains(HELLO_NO_VERSION) {
    Err(HandshakeError::NoVersion { min, max })
  } else {
    Err(HandshakeError::Unrecognized(reply.to_owned()))
  }
}

/// Elides long values, which are key material or full destinations
fn loggable(line: &str) -> String {
  const SHOWN: usize = 12;
  line
    .split_whitespace()
    .map(|token| match token.split_once('=') {
      Some((key, value)) if value.len() > 64 => {
        let shown: String = value.chars().take(SHOWN).collect();
        format!("{}={}..({} chars)", key, shown, value.len())
      }
      _ => token.to_owned(),
    })
    .collect::<Vec<_>>()
    .join(" ")
}
