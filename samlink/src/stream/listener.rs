// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;

use futures::Stream;

use super::{StreamConn, StreamError, StreamSession};
use crate::common::{destination::Destination, session::Session};

/// Accepts inbound streams addressed to a session's destination
#[derive(Clone, Debug)]
pub struct StreamListener {
  session: StreamSession,
}

impl StreamListener {
  pub(crate) fn new(session: StreamSession) -> Self {
    Self { session }
  }

  pub fn session(&self) -> &StreamSession {
    &self.session
  }

  pub fn addr(&self) -> &Destination {
    self.session.addr()
  }

  /// FROM_PORT reported by the most recent accept
  pub fn from_port(&self) -> u16 {
    self.session.from_port()
  }

  /// TO_PORT reported by the most recent accept
  pub fn to_port(&self) -> u16 {
    self.session.to_port()
  }

  pub async fn accept(&self) -> Result<StreamConn, StreamError> {
    self.session.accept().await
  }

  /// Accepted streams, one accept at a time, ending once the session closes
  pub fn incoming(&self) -> impl Stream<Item = Result<StreamConn, StreamError>> + Send + 'static {
    futures::stream::unfold(self.clone(), |listener| async move {
      if listener.session.is_closed() {
        return None;
      }
      let accepted = listener.accept().await;
      Some((accepted, listener))
    })
  }

  /// Closes the underlying session
  pub async fn close(&self) -> io::Result<()> {
    self.session.close().await
  }
}
