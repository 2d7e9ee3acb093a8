mod gencert;
mod serve;

use clap::{Args, Parser, Subcommand};
use mproxy::Result;
use std::net::SocketAddr;
use std::path::PathBuf;

const BIN_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[clap(author, version, about)]
#[command(args_conflicts_with_subcommands = true)]
struct Opt {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a locally signed cert, creating a root CA when none is
    /// supplied
    Cert(CertArgs),

    /// Run the pure tcp proxy
    Pure(PureArgs),
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, env = "MPROXY_LOG", default_value = "info")]
    pub log: tracing::Level,

    /// Listen address
    #[clap(short, long, default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Host to intercept (repeatable)
    #[clap(long = "host")]
    pub hosts: Vec<String>,

    /// TLS certificate file for interception
    #[clap(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// TLS private key file for interception
    #[clap(long, requires = "cert")]
    pub key: Option<PathBuf>,
}

#[derive(Args)]
pub struct CertArgs {
    /// Output file name prefix
    pub name: String,

    /// Existing ca cert file
    #[clap(long)]
    pub cacert: Option<PathBuf>,

    /// Existing ca key file
    #[clap(long)]
    pub cakey: Option<PathBuf>,

    /// Host to include in the cert (repeatable)
    #[clap(long = "hosts")]
    pub hosts: Vec<String>,
}

#[derive(Args)]
pub struct PureArgs {
    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, env = "MPROXY_LOG", default_value = "info")]
    pub log: tracing::Level,

    /// Listen address
    #[clap(short, long, default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    match opt.command {
        Some(Commands::Cert(args)) => {
            serve::init_logging(tracing::Level::INFO)?;
            gencert::generate(&args.name, args.cacert, args.cakey, &args.hosts)
        }
        Some(Commands::Pure(args)) => serve::pure(args),
        None => serve::run(opt.run),
    }
}
