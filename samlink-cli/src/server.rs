// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use samlink::{util::proxy_streams, Sam, SamConfig, Session, StreamConn, StreamError};
use std::{net::SocketAddr, path::PathBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Parameters for publishing a local TCP service as a destination
#[derive(Clone, Debug)]
pub struct ServerArgs {
  pub config: SamConfig,
  pub forward: SocketAddr,
  pub keys: Option<PathBuf>,
}

/// Accepts inbound streams until shutdown, proxying each to `forward`
pub async fn server_main(args: ServerArgs, shutdown: CancellationToken) -> Result<()> {
  let mut sam = Sam::connect(args.config)
    .await
    .context("Connecting to the SAM bridge")?;
  // Without a key file the published address is fresh on each run
  sam
    .ensure_keyfile(args.keys.as_deref())
    .await
    .context("Loading tunnel keys")?;
  let session = sam
    .new_stream_session()
    .await
    .context("Creating stream session")?;
  let base32 = session.addr().base32()?;
  tracing::info!(id = session.id(), %base32, forward = %args.forward, "Serving");
  println!("{}", base32);

  let listener = session.listen();
  loop {
    let accepted = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    let inbound = match accepted {
      Ok(inbound) => inbound,
      Err(StreamError::Closed) => break,
      Err(e) => {
        tracing::warn!(error = ?e, "Accept failed");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        continue;
      }
    };
    let forward = args.forward;
    let shutdown = shutdown.clone();
    tokio::task::spawn(async move {
      let remote = inbound.remote_addr().clone();
      tokio::select! {
        _ = shutdown.cancelled() => (),
        res = serve(inbound, forward) => match res {
          Ok((down, up)) => tracing::debug!(%remote, up, down, "Stream finished"),
          Err(e) => tracing::warn!(%remote, error = ?e, "Stream failed"),
        },
      }
    });
  }

  tracing::info!("Disconnecting...");
  listener.close().await.context("Closing stream session")?;
  Ok(())
}

async fn serve(inbound: StreamConn, forward: SocketAddr) -> Result<(u64, u64)> {
  let local = TcpStream::connect(forward)
    .await
    .with_context(|| format!("Connecting to {}", forward))?;
  Ok(proxy_streams(inbound, local).await?)
}
