use crate::{PureArgs, RunArgs};
use mproxy::{handler, net, ProxyHandler, PureProxy, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub fn init_logging(level: tracing::Level) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(level)
            .with_env_filter(filter)
            .finish(),
    )
    .map_err(std::io::Error::other)?;
    Ok(())
}

pub fn run(args: RunArgs) -> Result<()> {
    init_logging(args.log)?;
    tracing::info!("version: {}", env!("CARGO_PKG_VERSION"));

    runtime()?.block_on(async move {
        let handler = ProxyHandler::new()?;
        if let (Some(cert), Some(key)) = (args.cert, args.key) {
            handler.set_cert(&args.hosts, cert, key)?;
            tracing::info!("intercepting hosts: {:?}", args.hosts);
        }
        let listener = net::bind(args.addr).await?;
        tracing::info!("proxy listening on {}", args.addr);
        handler::serve(listener, handler).await
    })
}

pub fn pure(args: PureArgs) -> Result<()> {
    init_logging(args.log)?;

    runtime()?.block_on(async move {
        let proxy = PureProxy::new();
        let listener = net::bind(args.addr).await?;
        tracing::info!("pure proxy listening on {}", args.addr);
        proxy.serve(listener).await
    })
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}
