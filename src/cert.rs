//! X.509 issuance for the interception path: a self-signed root
//! certificate authority and leaf certificates minted for arbitrary
//! host lists, signed by that root.

use std::net::IpAddr;
use std::path::Path;

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

const VALIDITY_DAYS: i64 = 3650;

/// A root certificate and the private key that signs leaves with it.
pub struct CaPair {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl std::fmt::Debug for CaPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaPair").finish_non_exhaustive()
    }
}

impl CaPair {
    pub fn new(cert: Certificate, key: KeyPair) -> Self {
        Self { cert, key }
    }

    /// Load an existing CA from PEM-encoded material. Fails with
    /// [`Error::InvalidCa`] when the certificate cannot be parsed.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem).map_err(|_| Error::InvalidCa)?;
        let params =
            CertificateParams::from_ca_cert_pem(cert_pem).map_err(|_| Error::InvalidCa)?;
        let cert = params.self_signed(&key).map_err(|_| Error::InvalidCa)?;
        Ok(Self { cert, key })
    }

    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }
}

/// Create a self-signed root certificate for the given subject, signed
/// with the provided key.
pub fn create_root_cert(subject: DistinguishedName, key: &KeyPair) -> Result<Certificate> {
    let mut params = base_params(subject);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    Ok(params.self_signed(key)?)
}

/// Create a leaf certificate for `hosts`, signed by the CA. Host strings
/// that parse as IP literals become IP SANs, everything else a DNS SAN.
pub fn create_sign_cert(
    subject: DistinguishedName,
    key: &KeyPair,
    ca: &CaPair,
    hosts: &[String],
) -> Result<Certificate> {
    let mut params = base_params(subject);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    for host in hosts {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.as_str().try_into()?),
        };
        params.subject_alt_names.push(san);
    }
    Ok(params.signed_by(key, &ca.cert, &ca.key)?)
}

fn base_params(subject: DistinguishedName) -> CertificateParams {
    let not_before = OffsetDateTime::now_utc();
    let mut params = CertificateParams::default();
    params.serial_number = Some(serial_number());
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(VALIDITY_DAYS);
    params.distinguished_name = subject;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params
}

/// 128-bit random serial, so on-demand issuances never collide.
fn serial_number() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::DnType;
    use x509_parser::prelude::{parse_x509_certificate, GeneralName};

    fn subject(cn: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn
    }

    fn test_ca() -> CaPair {
        let key = KeyPair::generate().unwrap();
        let cert = create_root_cert(subject("test root"), &key).unwrap();
        CaPair::new(cert, key)
    }

    #[test]
    fn root_cert_is_a_ca() {
        let ca = test_ca();
        let (_, parsed) = parse_x509_certificate(ca.cert.der()).unwrap();
        assert!(parsed.is_ca());
        parsed.verify_signature(None).unwrap();
    }

    #[test]
    fn leaf_verifies_against_ca_and_partitions_sans() {
        let ca = test_ca();
        let hosts = vec![
            "example.test".to_string(),
            "10.0.0.1".to_string(),
            "echo.test".to_string(),
        ];
        let key = KeyPair::generate().unwrap();
        let leaf = create_sign_cert(subject("leaf"), &key, &ca, &hosts).unwrap();

        let (_, parsed) = parse_x509_certificate(leaf.der()).unwrap();
        let (_, ca_parsed) = parse_x509_certificate(ca.cert.der()).unwrap();
        parsed.verify_signature(Some(ca_parsed.public_key())).unwrap();
        assert!(!parsed.is_ca());

        let san = parsed
            .subject_alternative_name()
            .unwrap()
            .expect("leaf carries SAN extension");
        let mut dns = Vec::new();
        let mut ips = Vec::new();
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(d) => dns.push(d.to_string()),
                GeneralName::IPAddress(ip) => ips.push(ip.to_vec()),
                other => panic!("unexpected SAN {other:?}"),
            }
        }
        assert_eq!(dns, vec!["example.test", "echo.test"]);
        assert_eq!(ips, vec![vec![10, 0, 0, 1]]);
    }

    #[test]
    fn validity_window_is_ten_years() {
        let ca = test_ca();
        let (_, parsed) = parse_x509_certificate(ca.cert.der()).unwrap();
        let validity = parsed.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, VALIDITY_DAYS * 24 * 60 * 60);
    }

    #[test]
    fn serials_are_random() {
        let ca = test_ca();
        let key = KeyPair::generate().unwrap();
        let hosts = vec!["a.test".to_string()];
        let first = create_sign_cert(subject("leaf"), &key, &ca, &hosts).unwrap();
        let second = create_sign_cert(subject("leaf"), &key, &ca, &hosts).unwrap();
        let (_, first) = parse_x509_certificate(first.der()).unwrap();
        let (_, second) = parse_x509_certificate(second.der()).unwrap();
        assert_ne!(first.serial, second.serial);
    }

    #[test]
    fn ca_round_trips_through_pem() {
        let ca = test_ca();
        let reloaded = CaPair::from_pem(&ca.cert.pem(), &ca.key.serialize_pem()).unwrap();
        let key = KeyPair::generate().unwrap();
        let hosts = vec!["pem.test".to_string()];
        create_sign_cert(subject("leaf"), &key, &reloaded, &hosts).unwrap();
    }

    #[test]
    fn garbage_ca_is_rejected() {
        let err = CaPair::from_pem("not a cert", "not a key").unwrap_err();
        assert!(matches!(err, Error::InvalidCa));
    }
}
