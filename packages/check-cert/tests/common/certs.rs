// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509Name, X509Ref, X509};
use std::time::{SystemTime, UNIX_EPOCH};

fn name(cn: &str) -> Result<X509Name, ErrorStack> {
    let mut builder = X509NameBuilder::new()?;
    builder.append_entry_by_text("CN", cn)?;
    Ok(builder.build())
}

fn serial() -> Result<openssl::asn1::Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Validity window around the current time; `not_after_offset_days` may be
/// negative to produce an already-expired certificate.
fn validity(not_after_offset_days: i64) -> Result<(Asn1Time, Asn1Time), ErrorStack> {
    let now = unix_now();
    let not_before = Asn1Time::from_unix(now - 86400)?;
    let not_after = Asn1Time::from_unix(now + not_after_offset_days * 86400)?;
    Ok((not_before, not_after))
}

/// Make a self-signed CA certificate and private key.
pub fn mk_ca_cert(
    cn: &str,
    not_after_offset_days: i64,
) -> Result<(X509, PKey<Private>), ErrorStack> {
    mk_ca_cert_with_digest(cn, not_after_offset_days, MessageDigest::sha256())
}

/// Same, with an explicit signature digest for legacy-algorithm cases.
pub fn mk_ca_cert_with_digest(
    cn: &str,
    not_after_offset_days: i64,
    digest: MessageDigest,
) -> Result<(X509, PKey<Private>), ErrorStack> {
    let rsa = Rsa::generate(2048)?;
    let key_pair = PKey::from_rsa(rsa)?;
    let x509_name = name(cn)?;

    let mut cert_builder = X509::builder()?;
    cert_builder.set_version(2)?;
    let serial_number = serial()?;
    cert_builder.set_serial_number(&serial_number)?;
    cert_builder.set_subject_name(&x509_name)?;
    cert_builder.set_issuer_name(&x509_name)?;
    cert_builder.set_pubkey(&key_pair)?;
    let (not_before, not_after) = validity(not_after_offset_days)?;
    cert_builder.set_not_before(&not_before)?;
    cert_builder.set_not_after(&not_after)?;

    cert_builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    cert_builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&cert_builder.x509v3_context(None, None))?;
    cert_builder.append_extension(subject_key_identifier)?;

    cert_builder.sign(&key_pair, digest)?;
    Ok((cert_builder.build(), key_pair))
}

/// Make a leaf certificate signed by the given CA, with the given SANs and
/// signature digest.
pub fn mk_ca_signed_cert(
    ca_cert: &X509Ref,
    ca_key_pair: &PKeyRef<Private>,
    cn: &str,
    sans: &[&str],
    not_after_offset_days: i64,
    digest: MessageDigest,
) -> Result<(X509, PKey<Private>), ErrorStack> {
    let rsa = Rsa::generate(2048)?;
    let key_pair = PKey::from_rsa(rsa)?;

    let mut cert_builder = X509::builder()?;
    cert_builder.set_version(2)?;
    let serial_number = serial()?;
    cert_builder.set_serial_number(&serial_number)?;
    let x509_name = name(cn)?;
    cert_builder.set_subject_name(&x509_name)?;
    cert_builder.set_issuer_name(ca_cert.subject_name())?;
    cert_builder.set_pubkey(&key_pair)?;
    let (not_before, not_after) = validity(not_after_offset_days)?;
    cert_builder.set_not_before(&not_before)?;
    cert_builder.set_not_after(&not_after)?;

    cert_builder.append_extension(BasicConstraints::new().build()?)?;
    cert_builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&cert_builder.x509v3_context(Some(ca_cert), None))?;
    cert_builder.append_extension(subject_key_identifier)?;
    let auth_key_identifier = AuthorityKeyIdentifier::new()
        .keyid(false)
        .issuer(false)
        .build(&cert_builder.x509v3_context(Some(ca_cert), None))?;
    cert_builder.append_extension(auth_key_identifier)?;

    if !sans.is_empty() {
        let mut san_builder = SubjectAlternativeName::new();
        for san in sans {
            san_builder.dns(san);
        }
        let subject_alt_name =
            san_builder.build(&cert_builder.x509v3_context(Some(ca_cert), None))?;
        cert_builder.append_extension(subject_alt_name)?;
    }

    cert_builder.sign(ca_key_pair, digest)?;
    Ok((cert_builder.build(), key_pair))
}
