// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use samlink::{util, SamConfig, TunnelPreset};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use util::validators::{
  parse_sam_address, parse_signature_type, parse_socketaddr, parse_target, validate_sam_address,
  validate_signature_type, validate_socketaddr, validate_target,
};

mod client;
mod keygen;
mod server;

/// `RUST_LOG` wins; otherwise `DEBUG_I2P` picks the level, defaulting to errors only
fn log_filter() -> tracing_subscriber::EnvFilter {
  if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
    return filter;
  }
  let level = match std::env::var("DEBUG_I2P").ok().as_deref() {
    None | Some("") => "error",
    Some("warn") => "warn",
    Some("error") => "error",
    Some(_) => "debug",
  };
  tracing_subscriber::EnvFilter::new(level)
}

fn main() {
  let collector = tracing_subscriber::fmt()
    .with_env_filter(log_filter())
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("sam")
        .help("Bridge address; defaults to the sam_host and sam_port environment variables")
        .long("sam")
        .global(true)
        .validator(validate_sam_address)
        .takes_value(true),
    )
    .subcommand(
      Command::new("lookup")
        .about("Resolve an .i2p name to its destination")
        .arg(Arg::new("hostname").takes_value(true).required(true)),
    )
    .subcommand(
      Command::new("keygen")
        .about("Generate a new destination")
        .arg(
          Arg::new("signature")
            .long("signature")
            .short('s')
            .validator(validate_signature_type)
            .takes_value(true),
        )
        .arg(
          Arg::new("out")
            .help("Key file to write; keys are printed when absent")
            .long("out")
            .short('o')
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Bind a local port whose connections are forwarded to a remote destination")
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_target)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:8080")
            .takes_value(true),
        )
        .arg(keys_arg())
        .arg(name_arg())
        .arg(preset_arg()),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept inbound streams and forward each to a local service")
        .arg(
          Arg::new("forward")
            .long("forward")
            .short('f')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(keys_arg())
        .arg(name_arg())
        .arg(preset_arg()),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      eprintln!("{:#}", err);
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn keys_arg() -> Arg<'static> {
  Arg::new("keys")
    .help("Key file holding the tunnel's identity; created when missing")
    .long("keys")
    .short('k')
    .takes_value(true)
}

fn name_arg() -> Arg<'static> {
  Arg::new("name")
    .help("Tunnel name; generated when absent")
    .long("name")
    .short('n')
    .takes_value(true)
}

fn preset_arg() -> Arg<'static> {
  Arg::new("preset")
    .help("Tunnel shape")
    .long("preset")
    .possible_values(["humongous", "large", "wide", "medium", "default", "small", "zerohop"])
    .takes_value(true)
}

/// Bridge configuration from the environment, overridden by `--sam`
fn config_from_args(args: &'_ ArgMatches) -> Result<SamConfig> {
  let mut config = SamConfig::from_env().context("Invalid sam_host / sam_port environment")?;
  if let Some(sam) = args.value_of("sam") {
    config.set_sam_address(&parse_sam_address(sam)?)?;
  }
  Ok(config)
}

/// As [config_from_args], plus the `--name` and `--preset` of tunnel-creating subcommands
fn tunnel_config_from_args(args: &'_ ArgMatches) -> Result<SamConfig> {
  let mut config = config_from_args(args)?;
  if let Some(preset) = args.value_of("preset") {
    config.apply_preset(preset.parse::<TunnelPreset>()?);
  }
  if let Some(name) = args.value_of("name") {
    config.set_tunnel_name(name);
  }
  Ok(config)
}

/// Cancelled on Ctrl-C
fn shutdown_on_ctrl_c() -> (CancellationToken, tokio::task::JoinHandle<()>) {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  let sigint_handler_task = tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Interrupted; shutting down");
    shutdown_trigger.cancel();
  });
  (shutdown, sigint_handler_task)
}

pub async fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    config: tunnel_config_from_args(args)?,
    target: parse_target(args.value_of("target").context("Target is required")?)?,
    bind: parse_socketaddr(args.value_of("bind").context("Bind address is required")?)?,
    keys: args.value_of("keys").map(PathBuf::from),
  })
}

pub async fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    config: tunnel_config_from_args(args)?,
    forward: parse_socketaddr(
      args
        .value_of("forward")
        .context("Forward address is required")?,
    )?,
    keys: args.value_of("keys").map(PathBuf::from),
  })
}

pub async fn keygen_arg_handling(args: &'_ ArgMatches) -> Result<keygen::KeygenArgs> {
  Ok(keygen::KeygenArgs {
    config: config_from_args(args)?,
    signature: args
      .value_of("signature")
      .map(parse_signature_type)
      .transpose()?,
    out: args.value_of("out").map(PathBuf::from),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("lookup", opts)) => {
      let config = config_from_args(opts)?;
      let name = opts.value_of("hostname").context("Name is required")?;
      keygen::lookup_main(config, name).await
    }
    Some(("keygen", opts)) => {
      let args = keygen_arg_handling(opts).await?;
      keygen::keygen_main(args).await
    }
    Some(("client", opts)) => {
      let args = client_arg_handling(opts).await?;
      tracing::info!("Running as client with config {:#?}", args);
      let (shutdown, sigint_handler_task) = shutdown_on_ctrl_c();
      let res = client::client_main(args, shutdown).await;
      sigint_handler_task.abort();
      res
    }
    Some(("server", opts)) => {
      let args = server_arg_handling(opts).await?;
      tracing::info!("Running as server with config {:#?}", args);
      let (shutdown, sigint_handler_task) = shutdown_on_ctrl_c();
      let res = server::server_main(args, shutdown).await;
      sigint_handler_task.abort();
      res
    }
    _ => anyhow::bail!("Unknown subcommand"),
  }
}
