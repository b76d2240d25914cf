// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use samlink::{util::proxy_streams, Sam, SamConfig, Session, StreamSession};
use std::{net::SocketAddr, path::PathBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Parameters for forwarding a local TCP port to a remote destination
#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub config: SamConfig,
  pub target: String,
  pub bind: SocketAddr,
  pub keys: Option<PathBuf>,
}

/// Opens a stream session, then dials `target` once per local connection
pub async fn client_main(args: ClientArgs, shutdown: CancellationToken) -> Result<()> {
  let mut sam = Sam::connect(args.config)
    .await
    .context("Connecting to the SAM bridge")?;
  if let Some(path) = &args.keys {
    sam
      .ensure_keyfile(Some(path))
      .await
      .context("Loading tunnel keys")?;
  }
  let session = sam
    .new_stream_session()
    .await
    .context("Creating stream session")?;
  tracing::info!(id = session.id(), address = %session.addr(), "Stream session ready");

  let listener = TcpListener::bind(args.bind)
    .await
    .with_context(|| format!("Binding {}", args.bind))?;
  tracing::info!(bind = %args.bind, target = %args.target, "Listening for local connections");

  loop {
    let accepted = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    let (local, peer) = match accepted {
      Ok(accepted) => accepted,
      Err(e) => {
        tracing::warn!(error = ?e, "Local accept failed");
        continue;
      }
    };
    tracing::debug!(?peer, "Local connection accepted");
    let session = session.clone();
    let target = args.target.clone();
    let shutdown = shutdown.clone();
    tokio::task::spawn(async move {
      tokio::select! {
        _ = shutdown.cancelled() => (),
        res = forward(session, local, &target) => match res {
          Ok((up, down)) => tracing::debug!(?peer, up, down, "Forward finished"),
          Err(e) => tracing::warn!(?peer, error = ?e, "Forward failed"),
        },
      }
    });
  }

  tracing::info!("Disconnecting...");
  session.close().await.context("Closing stream session")?;
  Ok(())
}

async fn forward(session: StreamSession, local: TcpStream, target: &str) -> Result<(u64, u64)> {
  let remote = session
    .dial(target)
    .await
    .with_context(|| format!("Dialing {}", target))?;
  Ok(proxy_streams(local, remote).await?)
}
