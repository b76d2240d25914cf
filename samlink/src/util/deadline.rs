// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  future::Future,
  io,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  time::{Instant, Sleep},
};

pin_project_lite::pin_project! {
  /// A byte stream whose reads and writes fail with [io::ErrorKind::TimedOut] past their deadlines
  ///
  /// Deadlines are absolute and persist across calls until replaced or cleared.
  #[derive(Debug)]
  pub struct Timed<S> {
    #[pin]
    inner: S,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
  }
}

impl<S> Timed<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      read_deadline: None,
      write_deadline: None,
      read_timer: None,
      write_timer: None,
    }
  }

  pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
    self.read_deadline = deadline;
  }

  pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
    self.write_deadline = deadline;
  }

  pub fn set_deadline(&mut self, deadline: Option<Instant>) {
    self.set_read_deadline(deadline);
    self.set_write_deadline(deadline);
  }

  pub fn read_deadline(&self) -> Option<Instant> {
    self.read_deadline
  }

  pub fn write_deadline(&self) -> Option<Instant> {
    self.write_deadline
  }

  pub fn get_ref(&self) -> &S {
    &self.inner
  }

  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }

  pub fn into_inner(self) -> S {
    self.inner
  }
}

pub(crate) fn timed_out() -> io::Error {
  io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

/// Ready with an error once `deadline` has passed; pending (with a wakeup registered) before then
fn poll_deadline(
  timer: &mut Option<Pin<Box<Sleep>>>,
  deadline: Option<Instant>,
  cx: &mut Context<'_>,
) -> Poll<io::Error> {
  let Some(deadline) = deadline else {
    *timer = None;
    return Poll::Pending;
  };
  let timer = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
  if timer.deadline() != deadline {
    timer.as_mut().reset(deadline);
  }
  match timer.as_mut().poll(cx) {
    Poll::Ready(()) => Poll::Ready(timed_out()),
    Poll::Pending => Poll::Pending,
  }
}

impl<S: AsyncRead> AsyncRead for Timed<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.project();
    if let Poll::Ready(e) = poll_deadline(this.read_timer, *this.read_deadline, cx) {
      return Poll::Ready(Err(e));
    }
    this.inner.poll_read(cx, buf)
  }
}

impl<S: AsyncWrite> AsyncWrite for Timed<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    let this = self.project();
    if let Poll::Ready(e) = poll_deadline(this.write_timer, *this.write_deadline, cx) {
      return Poll::Ready(Err(e));
    }
    this.inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.project();
    if let Poll::Ready(e) = poll_deadline(this.write_timer, *this.write_deadline, cx) {
      return Poll::Ready(Err(e));
    }
    this.inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
  };

  use super::Timed;

  #[tokio::test]
  async fn read_fails_after_deadline() {
    let (a, mut b) = tokio::io::duplex(64);
    let mut timed = Timed::new(a);
    timed.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
    let mut buf = [0u8; 4];
    let err = tokio::time::timeout(Duration::from_secs(5), timed.read(&mut buf))
      .await
      .expect("Deadline must fire before the guard")
      .expect_err("Read must time out");
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    // Clearing the deadline makes the stream usable again
    timed.set_read_deadline(None);
    b.write_all(b"ping").await.unwrap();
    timed.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
  }

  #[tokio::test]
  async fn expired_write_deadline_fails_immediately() {
    let (a, _b) = tokio::io::duplex(64);
    let mut timed = Timed::new(a);
    timed.set_deadline(Some(Instant::now()));
    tokio::time::sleep(Duration::from_millis(1)).await;
    let err = timed.write_all(b"late").await.expect_err("Write must time out");
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    assert_eq!(timed.read_deadline(), timed.write_deadline());
  }
}
