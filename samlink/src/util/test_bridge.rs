// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Scripted stand-ins for the bridge's TCP control port and UDP relay

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use tokio::{
  io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
  net::{TcpListener, TcpStream, UdpSocket},
  sync::Mutex,
  task::JoinHandle,
};

use crate::common::config::SamConfig;

pub const HELLO_REPLY: &str = "HELLO REPLY RESULT=OK VERSION=3.1\n";

/// One action of a per-connection script
#[derive(Debug, Clone)]
pub enum Step {
  /// Read one command line; answer with `reply` if it starts with `expect`
  Reply { expect: String, reply: String },
  /// Write text without reading anything first
  Send(String),
  /// Echo every byte back until the peer closes
  Echo,
  /// Discard input until the peer closes
  Hold,
}

impl Step {
  pub fn reply(expect: &str, reply: &str) -> Self {
    Step::Reply {
      expect: expect.to_owned(),
      reply: reply.to_owned(),
    }
  }
}

/// Routes library logs to the test harness when `RUST_LOG` is set
pub fn init_logging() {
  if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init();
  }
}

pub fn hello() -> Step {
  Step::reply("HELLO VERSION", HELLO_REPLY)
}

type Received = Arc<Mutex<Vec<Vec<String>>>>;

/// Accepts control connections, running the n-th script on the n-th connection
///
/// Connections beyond the supplied scripts are dropped immediately. When a
/// script runs out the connection is closed.
pub struct FakeBridge {
  pub addr: SocketAddr,
  received: Received,
  task: JoinHandle<()>,
}

impl FakeBridge {
  pub async fn spawn(scripts: Vec<Vec<Step>>) -> Self {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0")
      .await
      .expect("Fake bridge must bind");
    let addr = listener.local_addr().expect("Bound listener has an address");
    let received: Received = Default::default();
    let task = tokio::task::spawn({
      let received = received.clone();
      async move {
        let mut scripts: VecDeque<_> = scripts.into();
        while let Ok((stream, _)) = listener.accept().await {
          let steps = match scripts.pop_front() {
            Some(steps) => steps,
            None => continue,
          };
          let index = {
            let mut received = received.lock().await;
            received.push(Vec::new());
            received.len() - 1
          };
          tokio::task::spawn(run_script(stream, index, steps, received.clone()));
        }
      }
    });
    Self {
      addr,
      received,
      task,
    }
  }

  pub fn address(&self) -> String {
    self.addr.to_string()
  }

  pub fn config(&self) -> SamConfig {
    let mut config = SamConfig::default();
    config.set_sam_host(self.addr.ip().to_string());
    config.sam_port = self.addr.port();
    config
  }

  /// Command lines read so far on the `connection`-th accepted connection
  pub async fn received(&self, connection: usize) -> Vec<String> {
    self
      .received
      .lock()
      .await
      .get(connection)
      .cloned()
      .unwrap_or_default()
  }

  pub async fn connection_count(&self) -> usize {
    self.received.lock().await.len()
  }
}

impl Drop for FakeBridge {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn run_script(stream: TcpStream, index: usize, steps: Vec<Step>, received: Received) {
  let (reader, mut writer) = stream.into_split();
  let mut reader = BufReader::new(reader);
  for step in steps {
    match step {
      Step::Reply { expect, reply } => {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
          Ok(0) | Err(_) => return,
          Ok(_) => {}
        }
        let line = line.trim_end_matches(['\r', '\n']).to_owned();
        let reply = if line.starts_with(&expect) {
          reply
        } else {
          format!("SCRIPT MISMATCH expected {:?} got {:?}\n", expect, line)
        };
        received.lock().await[index].push(line);
        if writer.write_all(reply.as_bytes()).await.is_err() {
          return;
        }
      }
      Step::Send(text) => {
        if writer.write_all(text.as_bytes()).await.is_err() {
          return;
        }
      }
      Step::Echo => {
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
      }
      Step::Hold => {
        let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
      }
    }
  }
}

/// Reflects outbound datagrams back to their sender as inbound ones
///
/// The `<version> <id> <destination>\n` header is replaced by
/// `<sender>\n` when a sender is configured, and stripped otherwise.
pub struct FakeRelay {
  pub addr: SocketAddr,
  headers: Arc<Mutex<Vec<String>>>,
  task: JoinHandle<()>,
}

impl FakeRelay {
  pub async fn spawn(sender: Option<String>) -> Self {
    let socket = UdpSocket::bind("127.0.0.1:0")
      .await
      .expect("Fake relay must bind");
    let addr = socket.local_addr().expect("Bound socket has an address");
    let headers: Arc<Mutex<Vec<String>>> = Default::default();
    let task = tokio::task::spawn({
      let headers = headers.clone();
      async move {
        let mut buf = vec![0u8; 64 * 1024];
        while let Ok((n, source)) = socket.recv_from(&mut buf).await {
          let packet = &buf[..n];
          let split = packet
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(packet.len());
          let header = String::from_utf8_lossy(&packet[..split]).into_owned();
          let payload = packet.get(split + 1..).unwrap_or_default();
          headers.lock().await.push(header);
          let mut reply = Vec::with_capacity(payload.len() + 1024);
          if let Some(sender) = &sender {
            reply.extend_from_slice(sender.as_bytes());
            reply.push(b'\n');
          }
          reply.extend_from_slice(payload);
          let _ = socket.send_to(&reply, source).await;
        }
      }
    });
    Self { addr, headers, task }
  }

  /// Headers of every datagram received so far
  pub async fn headers(&self) -> Vec<String> {
    self.headers.lock().await.clone()
  }
}

impl Drop for FakeRelay {
  fn drop(&mut self) {
    self.task.abort();
  }
}
