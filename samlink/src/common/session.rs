// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Capabilities and state shared by every session style

use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
  destination::{Destination, DestinationKeys},
  protocol::{
    control::{ConnectError, ControlConnection},
    resolver::{self, ResolveError},
    session::SessionStyle,
    SamVersion,
  },
};

/// The control connection whose lifetime is the lifetime of a tunnel at the bridge
pub type Keeper = Arc<Mutex<ControlConnection>>;

/// Operations common to stream, datagram, raw and primary sessions
pub trait Session: Send + Sync {
  fn id(&self) -> &str;

  fn style(&self) -> SessionStyle;

  fn keys(&self) -> &DestinationKeys;

  /// The public destination of this session
  fn addr(&self) -> &Destination {
    self.keys().address()
  }

  /// Tears the session down at the bridge; repeated calls are no-ops
  fn close(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// Identity, bridge location and keeper of an established session
#[derive(Debug)]
pub struct SessionCore {
  id: String,
  style: SessionStyle,
  keys: DestinationKeys,
  sam_address: String,
  sam_min: SamVersion,
  version: SamVersion,
  pub(crate) from_port: u16,
  pub(crate) to_port: u16,
  keeper: Keeper,
  owns_keeper: bool,
  closed: AtomicBool,
  /// Cancelled when this session or the primary it belongs to closes
  shutdown: CancellationToken,
}

impl SessionCore {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    id: String,
    style: SessionStyle,
    keys: DestinationKeys,
    sam_address: String,
    sam_min: SamVersion,
    version: SamVersion,
    keeper: Keeper,
    owns_keeper: bool,
  ) -> Self {
    Self {
      id,
      style,
      keys,
      sam_address,
      sam_min,
      version,
      from_port: 0,
      to_port: 0,
      keeper,
      owns_keeper,
      closed: AtomicBool::new(false),
      shutdown: CancellationToken::new(),
    }
  }

  pub(crate) fn with_ports(mut self, from_port: u16, to_port: u16) -> Self {
    self.from_port = from_port;
    self.to_port = to_port;
    self
  }

  /// A sub-session sharing this session's identity and keeper, without owning the keeper
  ///
  /// Closing this session closes the sub-session too.
  pub(crate) fn sub_session(
    &self,
    id: String,
    style: SessionStyle,
    from_port: u16,
    to_port: u16,
  ) -> Self {
    let mut sub = Self::new(
      id,
      style,
      self.keys.clone(),
      self.sam_address.clone(),
      self.sam_min,
      self.version,
      self.keeper.clone(),
      false,
    )
    .with_ports(from_port, to_port);
    sub.shutdown = self.shutdown.child_token();
    sub
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn style(&self) -> SessionStyle {
    self.style
  }

  pub fn keys(&self) -> &DestinationKeys {
    &self.keys
  }

  pub fn sam_address(&self) -> &str {
    &self.sam_address
  }

  /// Version negotiated on the keeper connection
  pub fn version(&self) -> SamVersion {
    self.version
  }

  pub(crate) fn keeper(&self) -> &Keeper {
    &self.keeper
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled()
  }

  pub(crate) fn shutdown(&self) -> &CancellationToken {
    &self.shutdown
  }

  /// Opens a further control connection to the same bridge
  pub(crate) async fn connect(&self) -> Result<ControlConnection, ConnectError> {
    ControlConnection::connect(&self.sam_address, self.sam_min, self.version).await
  }

  /// Resolves a name over a dedicated connection to this session's bridge
  pub(crate) async fn lookup(&self, name: &str) -> Result<Destination, ResolveError> {
    resolver::lookup_at(&self.sam_address, self.sam_min, self.version, name).await
  }

  /// Closes the keeper if this session owns it
  ///
  /// Sub-sessions share their primary's keeper and leave it open.
  pub(crate) async fn close(&self) -> io::Result<()> {
    self.shutdown.cancel();
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    tracing::debug!(id = %self.id, style = %self.style, "Closing session");
    if self.owns_keeper {
      self.keeper.lock().await.close().await
    } else {
      Ok(())
    }
  }
}
