//! Certificate material for the pairing protocol.
//!
//! Pairing needs three X.509 certificates: a self-signed host certificate,
//! the same certificate reused as the root, and a certificate for the
//! device whose public key is the one the device advertises through
//! `GetValue(DevicePublicKey)`. The device ships that key as PKCS#1 wrapped
//! in PEM; OpenSSL converts it to a proper SubjectPublicKeyInfo when the
//! certificate is built.

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509Name, X509};

const VALIDITY_DAYS: u32 = 30;

/// Certificates and key produced for a new pairing.
#[derive(Debug)]
pub struct PairCerts {
    pub host_certificate: X509,
    pub device_certificate: X509,
    pub host_private_key: PKey<Private>,
}

/// Generates a fresh 2048-bit host key, a self-signed host certificate and
/// a device certificate signed by the host key.
pub fn generate_pair_certs(device_public_key_pem: &[u8]) -> Result<PairCerts, ErrorStack> {
    let device_rsa = Rsa::public_key_from_pem_pkcs1(device_public_key_pem)?;
    let device_key = PKey::from_rsa(device_rsa)?;

    let host_key = PKey::from_rsa(Rsa::generate(2048)?)?;
    let host_certificate = make_cert(&host_key, &host_key, None)?;
    let device_certificate = make_cert(&host_key, &device_key, Some("Device"))?;

    Ok(PairCerts {
        host_certificate,
        device_certificate,
        host_private_key: host_key,
    })
}

/// Builds a version-3, SHA-256-signed certificate valid for thirty days.
/// `not_before` is backdated a minute to survive clock skew between host
/// and device.
fn make_cert<T: HasPublic>(
    signer: &PKeyRef<Private>,
    subject_key: &PKeyRef<T>,
    common_name: Option<&str>,
) -> Result<X509, ErrorStack> {
    let mut name = X509Name::builder()?;
    if let Some(cn) = common_name {
        name.append_entry_by_text("CN", cn)?;
    }
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(subject_key)?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let not_before = Asn1Time::from_unix(now - 60)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_after(&not_after)?;

    builder.sign(signer, MessageDigest::sha256())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_certs_carry_expected_keys() {
        let device_rsa = Rsa::generate(2048).unwrap();
        let device_pub_pem = device_rsa.public_key_to_pem_pkcs1().unwrap();

        let certs = generate_pair_certs(&device_pub_pem).unwrap();

        // Host cert is self-signed by the generated key.
        let host_pub = certs.host_certificate.public_key().unwrap();
        assert!(host_pub.public_eq(&certs.host_private_key));
        assert!(certs
            .host_certificate
            .verify(&certs.host_private_key)
            .unwrap());

        // Device cert carries the device's key in SubjectPublicKeyInfo
        // form and is signed by the host key.
        let dev_pub = certs.device_certificate.public_key().unwrap();
        let expected = PKey::from_rsa(Rsa::public_key_from_pem_pkcs1(&device_pub_pem).unwrap())
            .unwrap();
        assert!(dev_pub.public_eq(&expected));
        assert!(certs
            .device_certificate
            .verify(&certs.host_private_key)
            .unwrap());

        // CN is set only on the device certificate.
        let cn = certs
            .device_certificate
            .subject_name()
            .entries()
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "Device");
        assert!(certs.host_certificate.subject_name().entries().next().is_none());
    }
}
