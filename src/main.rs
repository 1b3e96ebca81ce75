use std::sync::Arc;
use anyhow::{anyhow, bail};
use clap::Parser;
use clap_derive::Parser;
use persist_tunnel::client::TunnelClient;
use persist_tunnel::config::{ClientConfig, ServerConfig, TunnelConfig};
use persist_tunnel::listen_spec::ListenSpec;
use persist_tunnel::net::TcpConnector;
use persist_tunnel::server::TunnelServer;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, Level};

/// Tunnels TCP connections over a link that may drop, resuming sessions without losing or
///  duplicating data
#[derive(Parser)]
struct Args {
    /// [listen-host:]listen-port:host:port[:host:port...] - accept user connections and tunnel
    ///  them to the first reachable tunnel server
    #[clap(long)]
    client: Vec<String>,

    /// [listen-host:]listen-port:service-host:service-port - accept tunnel connections and
    ///  forward them to the service
    #[clap(long)]
    server: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.client.is_empty() && args.server.is_empty() {
        return Err(anyhow!("nothing to do - specify at least one --client or --server"));
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let connector = Arc::new(TcpConnector);
    let mut listeners = JoinSet::new();

    for s in &args.client {
        let spec: ListenSpec = s.parse()?;
        let client = TunnelClient::new(TunnelConfig::default(), ClientConfig { candidates: spec.connect }, connector.clone())?;

        let listener = TcpListener::bind(&spec.listen).await?;
        info!("listening for user connections on {}", spec.listen);
        listeners.spawn(async move { client.serve(listener).await });
    }

    for s in &args.server {
        let spec: ListenSpec = s.parse()?;
        if spec.connect.len() != 1 {
            bail!("{:?}: a server forwards to exactly one service", s);
        }
        let destination = spec.connect.into_iter().next()
            .ok_or_else(|| anyhow!("{:?}: missing service address", s))?;
        let server = TunnelServer::new(TunnelConfig::default(), ServerConfig { destination }, connector.clone())?;

        let listener = TcpListener::bind(&spec.listen).await?;
        info!("listening for tunnel connections on {}", spec.listen);
        listeners.spawn(async move { server.serve(listener).await });
    }

    while let Some(joined) = listeners.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("listener terminated: {}", e);
                return Err(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
