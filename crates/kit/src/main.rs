//! Command-line front end: configuration checking and standalone tunnels.

use std::io::BufRead;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::eyre::Context as _;
use color_eyre::{Report, Result};

use xvk::config::BuildConfig;
use xvk::tunnel::create_tunnel;

/// Unattended VM provisioning over a single SSH connection.
///
/// xvk bridges the guest-only network behind a hypervisor management host:
/// it opens an SSH-backed SOCKS5 proxy, forwards guest services to local
/// ports, and drives the VM console for unattended installs.
#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Validate a build configuration file.
#[derive(Parser)]
struct CheckConfigOpts {
    /// Path to the TOML configuration
    config: Utf8PathBuf,

    /// Print the resolved configuration as JSON (password redacted)
    #[clap(long)]
    json: bool,
}

/// Open the tunnel from a configuration and keep it up interactively.
#[derive(Parser)]
struct TunnelOpts {
    /// Path to the TOML configuration
    config: Utf8PathBuf,

    /// Additionally forward this guest target to a local port
    #[clap(long, value_name = "HOST:PORT")]
    forward: Vec<String>,
}

/// Available xvk commands.
#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    #[clap(name = "check-config")]
    CheckConfig(CheckConfigOpts),

    /// Bring up the SSH/SOCKS tunnel and hold it open
    Tunnel(TunnelOpts),
}

fn load_config(path: &Utf8PathBuf) -> Result<BuildConfig> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {path}"))?;
    BuildConfig::from_toml(&text).wrap_err_with(|| format!("parsing {path}"))
}

fn check_config(opts: CheckConfigOpts) -> Result<()> {
    let config = load_config(&opts.config)?;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{} is valid", opts.config);
    }
    Ok(())
}

fn tunnel(opts: TunnelOpts) -> Result<()> {
    let config = load_config(&opts.config)?;
    let tunnel = create_tunnel(config.skip_nat_mapping, &config.remote)?;
    tunnel.start()?;

    if let Some(addr) = tunnel.socks_addr() {
        println!("SOCKS5 proxy listening on {addr}");
    } else {
        println!("direct mode: guest network assumed routable, no proxy started");
    }

    let mut forwardings = Vec::new();
    for target in &opts.forward {
        let (host, port) = xvk::tunnel::split_host_port(target)?;
        let mut forwarding = tunnel.create_forwarding(host.clone(), port);
        forwarding.start()?;
        println!(
            "forwarding {}:{} -> {host}:{port}",
            forwarding.service_host(),
            forwarding.service_port()
        );
        forwardings.push(forwarding);
    }

    println!("press Enter to close the tunnel");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    for mut forwarding in forwardings.into_iter().rev() {
        forwarding.close();
    }
    tunnel.close();
    Ok(())
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr and are filtered by the RUST_LOG environment
/// variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::CheckConfig(opts) => check_config(opts)?,
        Commands::Tunnel(opts) => tunnel(opts)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
