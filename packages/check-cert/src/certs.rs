// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use log::warn;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

pub const OID_MD2_RSA: &str = "1.2.840.113549.1.1.2";
pub const OID_MD5_RSA: &str = "1.2.840.113549.1.1.4";
pub const OID_SHA1_RSA: &str = "1.2.840.113549.1.1.5";
pub const OID_DSA_SHA1: &str = "1.2.840.10040.4.3";
pub const OID_ECDSA_SHA1: &str = "1.2.840.10045.4.1";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed certificate encoding: {0}")]
    Malformed(String),
}

/// Role of a certificate within the chain that presented it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPosition {
    Leaf,
    LeafSelfSigned,
    Intermediate,
    Root,
    Unknown,
}

impl Display for ChainPosition {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                Self::Leaf => "leaf",
                Self::LeafSelfSigned => "self-signed leaf",
                Self::Intermediate => "intermediate",
                Self::Root => "root",
                Self::Unknown => "unknown",
            }
        )
    }
}

/// Immutable view over one parsed X.509 record.
///
/// All fields are extracted once at parse time; the wrapper owns the DER so
/// the certificate can be handed between pipeline stages without lifetimes.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub(crate) subject: String,
    pub(crate) issuer: String,
    pub(crate) sans: Vec<String>,
    pub(crate) serial: Vec<u8>,
    pub(crate) not_before: OffsetDateTime,
    pub(crate) not_after: OffsetDateTime,
    pub(crate) signature_algorithm: String,
    pub(crate) signature_algorithm_oid: String,
    pub(crate) key_cert_sign: bool,
    pub(crate) has_key_usage: bool,
    pub(crate) has_ext_key_usage: bool,
    pub(crate) is_ca: bool,
    pub(crate) version: u32,
    pub(crate) self_signed: bool,
    pub(crate) der: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, ParseError> {
        let (_rem, cert) = X509Certificate::from_der(der)
            .map_err(|err| ParseError::Malformed(err.to_string()))?;

        let sans = subject_alt_names(&cert);
        let key_usage = cert.key_usage().ok().flatten();
        let oid = cert.signature_algorithm.algorithm.to_id_string();

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            sans,
            serial: cert.raw_serial().to_vec(),
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            signature_algorithm: signature_algorithm_name(&oid).to_string(),
            signature_algorithm_oid: oid,
            key_cert_sign: key_usage.as_ref().is_some_and(|ku| ku.value.key_cert_sign()),
            has_key_usage: key_usage.is_some(),
            has_ext_key_usage: cert.extended_key_usage().ok().flatten().is_some(),
            is_ca: cert
                .basic_constraints()
                .ok()
                .flatten()
                .is_some_and(|bc| bc.value.ca),
            version: cert.version().0 + 1,
            self_signed: is_self_signed(&cert, der),
            der: der.to_vec(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    /// Raw big-endian two's-complement serial bytes as found in the DER.
    pub fn raw_serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn signature_algorithm(&self) -> &str {
        &self.signature_algorithm
    }

    pub fn is_self_signed(&self) -> bool {
        self.self_signed
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn has_weak_signature(&self) -> bool {
        matches!(
            self.signature_algorithm_oid.as_str(),
            OID_MD2_RSA | OID_MD5_RSA | OID_SHA1_RSA | OID_DSA_SHA1 | OID_ECDSA_SHA1
        )
    }
}

/// Ordered sequence of certificates, position 0 being the peer-presented
/// leaf. The order is preserved exactly as received; nothing here reorders.
#[derive(Debug, Clone, Default)]
pub struct Chain(Vec<Certificate>);

impl Chain {
    pub fn from_der_chain(ders: &[Vec<u8>]) -> Result<Self, ParseError> {
        Ok(Self(
            ders.iter()
                .map(|der| Certificate::from_der(der))
                .collect::<Result<Vec<_>, _>>()?,
        ))
    }

    pub fn new(certs: Vec<Certificate>) -> Self {
        Self(certs)
    }

    pub fn certs(&self) -> &[Certificate] {
        &self.0
    }

    pub fn leaf(&self) -> Option<&Certificate> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Assign a role to every certificate of the chain.
///
/// Self-signedness is decided first (subject == issuer plus a verifying
/// signature), then a decision tree over the x509 version, `IsCA`,
/// `KeyUsage`, `ExtKeyUsage` and the position within this chain.
pub fn classify_chain(chain: &Chain) -> Vec<ChainPosition> {
    chain
        .certs()
        .iter()
        .enumerate()
        .map(|(i, cert)| classify(cert, i))
        .collect()
}

fn classify(cert: &Certificate, index: usize) -> ChainPosition {
    match cert.version {
        1 | 2 => match (cert.self_signed, index) {
            (true, 0) => ChainPosition::LeafSelfSigned,
            (true, _) => ChainPosition::Root,
            (false, 0) => ChainPosition::Leaf,
            (false, _) => ChainPosition::Intermediate,
        },
        3 => {
            if cert.self_signed {
                if cert.is_ca {
                    ChainPosition::Root
                } else if cert.has_ext_key_usage {
                    ChainPosition::LeafSelfSigned
                } else if cert.key_cert_sign {
                    ChainPosition::Root
                } else {
                    ChainPosition::LeafSelfSigned
                }
            } else if cert.is_ca {
                ChainPosition::Intermediate
            } else if cert.has_ext_key_usage {
                ChainPosition::Leaf
            } else if cert.key_cert_sign {
                ChainPosition::Intermediate
            } else {
                ChainPosition::Leaf
            }
        }
        version => {
            warn!(
                "cannot classify certificate '{}': unhandled x509 version {}",
                cert.subject, version
            );
            ChainPosition::Unknown
        }
    }
}

fn is_self_signed(cert: &X509Certificate, der: &[u8]) -> bool {
    if cert.subject() != cert.issuer() {
        return false;
    }
    match cert.verify_signature(None) {
        Ok(()) => true,
        // The verifier refuses MD5-with-RSA on security grounds; legacy
        // devices still present such roots, so check the signature by hand.
        Err(X509Error::SignatureUnsupportedAlgorithm) => {
            if cert.signature_algorithm.algorithm.to_id_string() == OID_MD5_RSA {
                verify_md5_rsa(
                    der,
                    cert.tbs_certificate.as_ref(),
                    cert.signature_value.data.as_ref(),
                )
            } else {
                // Unverifiable is not the same as failed verification.
                true
            }
        }
        Err(_) => false,
    }
}

fn verify_md5_rsa(der: &[u8], tbs: &[u8], signature: &[u8]) -> bool {
    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;
    use openssl::x509::X509;

    let Ok(cert) = X509::from_der(der) else {
        return false;
    };
    let Ok(pkey) = cert.public_key() else {
        return false;
    };
    let Ok(mut verifier) = Verifier::new(MessageDigest::md5(), &pkey) else {
        return false;
    };
    verifier.update(tbs).is_ok() && verifier.verify(signature).unwrap_or(false)
}

fn subject_alt_names(cert: &X509Certificate) -> Vec<String> {
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_string()),
            GeneralName::IPAddress(bytes) => format_ip(bytes),
            _ => None,
        })
        .collect()
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)).to_string())
        }
        _ => None,
    }
}

fn signature_algorithm_name(oid: &str) -> &'static str {
    match oid {
        OID_MD2_RSA => "md2WithRSAEncryption",
        OID_MD5_RSA => "md5WithRSAEncryption",
        OID_SHA1_RSA => "sha1WithRSAEncryption",
        "1.2.840.113549.1.1.10" => "rsassa-pss",
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption",
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption",
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption",
        OID_DSA_SHA1 => "dsaWithSHA1",
        "2.16.840.1.101.3.4.3.2" => "dsaWithSHA256",
        OID_ECDSA_SHA1 => "ecdsaWithSHA1",
        "1.2.840.10045.4.3.2" => "ecdsaWithSHA256",
        "1.2.840.10045.4.3.3" => "ecdsaWithSHA384",
        "1.2.840.10045.4.3.4" => "ecdsaWithSHA512",
        "1.3.101.112" => "ed25519",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) fn synthetic() -> Certificate {
    use time::macros::datetime;

    Certificate {
        subject: "CN=leaf.example.com".to_string(),
        issuer: "CN=Test CA".to_string(),
        sans: vec!["leaf.example.com".to_string()],
        serial: vec![0x01, 0xf4],
        not_before: datetime!(2024-01-01 00:00:00 UTC),
        not_after: datetime!(2027-01-01 00:00:00 UTC),
        signature_algorithm: "sha256WithRSAEncryption".to_string(),
        signature_algorithm_oid: "1.2.840.113549.1.1.11".to_string(),
        key_cert_sign: false,
        has_key_usage: true,
        has_ext_key_usage: true,
        is_ca: false,
        version: 3,
        self_signed: false,
        der: Vec::new(),
    }
}
