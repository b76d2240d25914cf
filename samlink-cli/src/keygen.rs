// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use samlink::{Sam, SamConfig, SignatureType};
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct KeygenArgs {
  pub config: SamConfig,
  pub signature: Option<SignatureType>,
  pub out: Option<PathBuf>,
}

pub async fn keygen_main(args: KeygenArgs) -> Result<()> {
  let mut sam = Sam::connect(args.config)
    .await
    .context("Connecting to the SAM bridge")?;
  let keys = sam
    .new_keys(args.signature)
    .await
    .context("Generating destination")?;
  let _ = sam.close().await;
  match args.out {
    Some(path) => {
      keys
        .store(&path)
        .await
        .with_context(|| format!("Writing key file {}", path.display()))?;
      tracing::info!(path = %path.display(), "Stored keys");
      println!("{}", keys.address().base32()?);
    }
    None => println!("{}", keys.to_keyfile()),
  }
  Ok(())
}

pub async fn lookup_main(config: SamConfig, name: &str) -> Result<()> {
  let mut sam = Sam::connect(config)
    .await
    .context("Connecting to the SAM bridge")?;
  let destination = sam
    .lookup(name)
    .await
    .with_context(|| format!("Looking up {}", name))?;
  let _ = sam.close().await;
  println!("{}", destination);
  println!("{}", destination.base32()?);
  Ok(())
}
