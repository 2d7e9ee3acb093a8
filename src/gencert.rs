//! `cert` subcommand: writes `<name>.cert` / `<name>.key` signed by an
//! existing CA, or by a freshly generated `<name>-ca.cert` / `<name>-ca.key`
//! pair when none is supplied. Never overwrites existing files.

use std::fs;
use std::path::{Path, PathBuf};

use mproxy::cert::{self, CaPair};
use mproxy::{Error, Result};
use rcgen::{DistinguishedName, DnType, KeyPair};

pub fn generate(
    name: &str,
    cacert: Option<PathBuf>,
    cakey: Option<PathBuf>,
    hosts: &[String],
) -> Result<()> {
    let cert_file = format!("{name}.cert");
    let key_file = format!("{name}.key");
    ensure_absent(&cert_file)?;
    ensure_absent(&key_file)?;

    let ca = match (cacert, cakey) {
        (Some(cacert), Some(cakey)) => CaPair::from_pem_files(cacert, cakey)?,
        _ => generate_ca(name)?,
    };

    let key = KeyPair::generate()?;
    let cert = cert::create_sign_cert(subject(name), &key, &ca, hosts)?;
    write_cert_files(&cert_file, &key_file, &cert.pem(), &key.serialize_pem())?;
    tracing::info!("generate cert successful");
    Ok(())
}

fn generate_ca(name: &str) -> Result<CaPair> {
    let cert_file = format!("{name}-ca.cert");
    let key_file = format!("{name}-ca.key");
    ensure_absent(&cert_file)?;
    ensure_absent(&key_file)?;

    tracing::info!("generating self-signed root ca");
    let key = KeyPair::generate()?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{name} CA"));
    dn.push(DnType::OrganizationName, crate::BIN_NAME);
    let cert = cert::create_root_cert(dn, &key)?;
    write_cert_files(&cert_file, &key_file, &cert.pem(), &key.serialize_pem())?;
    Ok(CaPair::new(cert, key))
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, crate::BIN_NAME);
    dn
}

fn ensure_absent(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        tracing::warn!("file exists: {path}");
        return Err(Error::FileExists(path.to_string()));
    }
    Ok(())
}

fn write_cert_files(
    cert_path: &str,
    key_path: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<()> {
    fs::write(cert_path, cert_pem)?;
    write_key_file(key_path, key_pem)?;
    Ok(())
}

// Private keys are created readable by the owner only.
#[cfg(unix)]
fn write_key_file(path: &str, key_pem: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key_pem.as_bytes())
}

#[cfg(not(unix))]
fn write_key_file(path: &str, key_pem: &str) -> std::io::Result<()> {
    fs::write(path, key_pem)
}
