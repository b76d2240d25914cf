// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client for the SAMv3 bridge of an I2P router.
//!
//! A [`Sam`](common::sam::Sam) controller performs the version handshake and
//! turns into one of the session styles: [`stream`], [`datagram`] (also raw),
//! or a [`primary`] session multiplexing several sub-sessions over a single
//! control connection.

pub mod common;
pub mod datagram;
pub mod primary;
pub mod stream;
pub mod util;

pub use common::{
  config::{ConfigError, SamConfig, TunnelPreset},
  destination::{Destination, DestinationError, DestinationKeys, SignatureType},
  protocol::{
    control::{ConnectError, ControlConnection, HandshakeError},
    resolver::ResolveError,
    session::{SessionError, SessionStyle},
    SamVersion,
  },
  sam::{KeygenError, Sam},
  session::Session,
};
pub use datagram::{DatagramError, DatagramSession, RawSession};
pub use primary::{PrimaryConn, PrimaryError, PrimarySession, SubSession};
pub use stream::{DialContext, StreamConn, StreamError, StreamListener, StreamSession};
