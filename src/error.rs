use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Http(#[from] http::Error),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),

    #[error(transparent)]
    HyperClient(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Rcgen(#[from] rcgen::Error),

    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("invalid cert file or hosts")]
    InvalidCert,

    #[error("invalid ca certificate")]
    InvalidCa,

    #[error("server closed")]
    ServerClosed,

    #[error("request header fields too large")]
    HeadersTooLarge,

    #[error("cannot find host in request headers")]
    MissingHost,

    #[error("malformed request line")]
    BadRequestLine,

    #[error("{0} already exists in current dir")]
    FileExists(String),
}
