// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod deadline;
pub mod validators;

#[cfg(test)]
pub(crate) mod test_bridge;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Copies bytes both ways until both directions reach end-of-stream
///
/// Each side's writer is shut down once the opposite reader finishes, so
/// half-closes propagate. Returns the byte counts `(a to b, b to a)`.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_streams<A, B>(a: A, b: B) -> Result<(u64, u64), std::io::Error>
where
  A: AsyncRead + AsyncWrite,
  B: AsyncRead + AsyncWrite,
{
  let (reader_a, mut writer_a) = tokio::io::split(a);
  let (reader_b, mut writer_b) = tokio::io::split(b);
  let mut reader_a = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_a);
  let mut reader_b = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_b);
  let proxy_a2b = async {
    let copied = tokio::io::copy_buf(&mut reader_a, &mut writer_b).await?;
    writer_b.shutdown().await?;
    Ok::<_, std::io::Error>(copied)
  }
  .fuse();
  let proxy_b2a = async {
    let copied = tokio::io::copy_buf(&mut reader_b, &mut writer_a).await?;
    writer_a.shutdown().await?;
    Ok::<_, std::io::Error>(copied)
  }
  .fuse();
  match futures::future::try_join(proxy_a2b, proxy_b2a).await {
    Ok(counts) => Ok(counts),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy copy ended with error");
      Err(e)
    }
  }
}
