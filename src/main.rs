//! ech-tunnel entry point
//!
//! # Usage
//!
//! ```bash
//! # Local proxy, flags only
//! ech-tunnel ingress --server worker.example.dev:443 --token secret
//!
//! # Local proxy from a config file, flags win over the file
//! ech-tunnel ingress -c ingress.json --routing-mode global
//!
//! # Server end, configured from the environment
//! TOKEN=secret MAX_SESSIONS=200 ech-tunnel egress
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use ech_tunnel::config::{load_egress_env, load_ingress_file, IngressConfig, RoutingMode};
use ech_tunnel::{EgressServer, IngressServer};

struct IngressArgs {
    config_path: Option<PathBuf>,
    listen: Option<String>,
    server: Option<String>,
    server_ip: Option<String>,
    token: Option<String>,
    doh_url: Option<String>,
    ech_domain: Option<String>,
    routing_mode: Option<String>,
    allow_no_ech: bool,
}

fn print_help() {
    println!(
        r#"ech-tunnel v{}

TCP-over-WebSocket tunnel with Encrypted Client Hello.

USAGE:
    ech-tunnel ingress [OPTIONS]
    ech-tunnel egress

INGRESS OPTIONS:
    -c, --config <FILE>       JSON configuration file
    -l, --listen <ADDR>       Listen address (default 127.0.0.1:30000)
    -s, --server <ADDR>       Egress server, host:port[/path] (required)
        --server-ip <IP>      Dial this IP instead of resolving the host
    -t, --token <TOKEN>       Shared token
        --doh-url <URL>       DoH endpoint for the ECH lookup
        --ech-domain <NAME>   Domain publishing the ECH config
        --routing-mode <MODE> global | bypass_cn | none
        --allow-no-ech        Permit plain TLS when ECH cannot be resolved

EGRESS:
    Configured from the environment: LISTEN_ADDR, TOKEN, FALLBACK_IPS,
    CONNECT_TIMEOUT_MS, READ_TIMEOUT_MS, MAX_SESSIONS, ALLOWED_HOSTS,
    ALLOW_ORIGIN, LOG_LEVEL.

OPTIONS:
    -h, --help                Print this help
    -V, --version             Print version
"#,
        ech_tunnel::VERSION
    );
}

fn parse_ingress_args(mut args: std::env::Args) -> Result<IngressArgs> {
    let mut parsed = IngressArgs {
        config_path: None,
        listen: None,
        server: None,
        server_ip: None,
        token: None,
        doh_url: None,
        ech_domain: None,
        routing_mode: None,
        allow_no_ech: false,
    };

    while let Some(arg) = args.next() {
        let mut value = |name: &str| -> Result<String> {
            args.next()
                .with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "-c" | "--config" => parsed.config_path = Some(PathBuf::from(value("--config")?)),
            "-l" | "--listen" => parsed.listen = Some(value("--listen")?),
            "-s" | "--server" => parsed.server = Some(value("--server")?),
            "--server-ip" => parsed.server_ip = Some(value("--server-ip")?),
            "-t" | "--token" => parsed.token = Some(value("--token")?),
            "--doh-url" => parsed.doh_url = Some(value("--doh-url")?),
            "--ech-domain" => parsed.ech_domain = Some(value("--ech-domain")?),
            "--routing-mode" => parsed.routing_mode = Some(value("--routing-mode")?),
            "--allow-no-ech" => parsed.allow_no_ech = true,
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(parsed)
}

fn build_ingress_config(args: IngressArgs) -> Result<IngressConfig> {
    let mut config = match &args.config_path {
        Some(path) => load_ingress_file(path)?,
        None => IngressConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(ip) = args.server_ip {
        config.server_ip = Some(ip.parse().context("invalid --server-ip")?);
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }
    if let Some(url) = args.doh_url {
        config.doh_url = url;
    }
    if let Some(domain) = args.ech_domain {
        config.ech_domain = domain;
    }
    if let Some(mode) = args.routing_mode {
        config.routing_mode = RoutingMode::parse(&mode)?;
    }
    if args.allow_no_ech {
        config.allow_no_ech = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    // LOG_LEVEL is the egress deployment convention; RUST_LOG wins
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL").map(|level| EnvFilter::new(level.to_ascii_lowercase()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("crypto provider already installed");
    }

    let mut args = std::env::args();
    let _program = args.next();
    let command = args.next().unwrap_or_default();

    match command.as_str() {
        "ingress" => {
            let config = build_ingress_config(parse_ingress_args(args)?)?;
            let server = Arc::new(
                IngressServer::build(config)
                    .await
                    .context("failed to start ingress")?,
            );
            let runner = {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.run().await })
            };
            signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("signal received, stopping");
            server.shutdown();
            runner.await.context("ingress task panicked")??;
        }
        "egress" => {
            if args.next().is_some() {
                bail!("egress takes no arguments; it is configured from the environment");
            }
            let config = load_egress_env().context("invalid egress environment")?;
            let server = Arc::new(EgressServer::new(config));
            let runner = {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.run().await })
            };
            signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("signal received, stopping");
            server.shutdown();
            runner.await.context("egress task panicked")??;
        }
        "-V" | "--version" => println!("ech-tunnel v{}", ech_tunnel::VERSION),
        "-h" | "--help" | "" => print_help(),
        other => {
            print_help();
            bail!("unknown command: {other}");
        }
    }

    Ok(())
}
