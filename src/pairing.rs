//! Pair records: the long-lived credential set for one (host, device) pair.
//!
//! Records are created once by the pairing protocol in
//! [`crate::lockdown::LockdownClient::pair`], stored by the mux daemon and
//! mirrored into a PEM cache file for inspection by other tooling. They are
//! never mutated, only replaced.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use plist::Data;
use serde::{Deserialize, Serialize};

use crate::DeviceError;

/// Parsed pair record with ready-to-use OpenSSL types.
#[derive(Clone, Debug)]
pub struct PairRecord {
    pub device_certificate: X509,
    pub host_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub root_certificate: X509,
    pub root_private_key: Option<PKey<Private>>,
    pub host_id: String,
    pub system_buid: String,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
}

/// Byte-level mirror of the property list shape the daemon stores.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairRecord {
    device_certificate: Data,
    host_certificate: Data,
    host_private_key: Data,
    root_certificate: Data,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_private_key: Option<Data>,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress", skip_serializing_if = "Option::is_none")]
    wifi_mac_address: Option<String>,
}

impl PairRecord {
    /// Parses a record from plist bytes (binary or XML).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        let raw: RawPairRecord = match plist::from_bytes(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("pair record bytes do not parse: {e:?}");
                return Err(DeviceError::Plist(e));
            }
        };
        raw.try_into().map_err(DeviceError::TlsSetup)
    }

    pub fn from_value(value: &plist::Value) -> Result<Self, DeviceError> {
        let raw: RawPairRecord = plist::from_value(value)?;
        raw.try_into().map_err(DeviceError::TlsSetup)
    }

    /// Serializes to the XML plist shape `SavePairRecord` expects.
    pub fn serialize(&self) -> Result<Vec<u8>, DeviceError> {
        let raw = RawPairRecord::try_from(self).map_err(DeviceError::TlsSetup)?;
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl TryFrom<RawPairRecord> for PairRecord {
    type Error = openssl::error::ErrorStack;

    fn try_from(value: RawPairRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.device_certificate))?,
            host_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.host_certificate))?,
            host_private_key: PKey::private_key_from_pem(&Into::<Vec<u8>>::into(
                value.host_private_key,
            ))?,
            root_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.root_certificate))?,
            root_private_key: match value.root_private_key {
                Some(k) => Some(PKey::private_key_from_pem(&Into::<Vec<u8>>::into(k))?),
                None => None,
            },
            host_id: value.host_id,
            system_buid: value.system_buid,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
        })
    }
}

impl TryFrom<&PairRecord> for RawPairRecord {
    type Error = openssl::error::ErrorStack;

    fn try_from(value: &PairRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: Data::new(value.device_certificate.to_pem()?),
            host_certificate: Data::new(value.host_certificate.to_pem()?),
            host_private_key: Data::new(value.host_private_key.private_key_to_pem_pkcs8()?),
            root_certificate: Data::new(value.root_certificate.to_pem()?),
            root_private_key: match &value.root_private_key {
                Some(k) => Some(Data::new(k.private_key_to_pem_pkcs8()?)),
                None => None,
            },
            host_id: value.host_id.clone(),
            system_buid: value.system_buid.clone(),
            escrow_bag: value.escrow_bag.clone().map(Data::new),
            wifi_mac_address: value.wifi_mac_address.clone(),
        })
    }
}

// One writer at a time; the cache is process-wide state shared by every
// Device handle.
static PEM_LOCK: Mutex<()> = Mutex::new(());

const PEM_REFRESH_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Mirrors the host key + certificate into `~/.tmqdevice/ssl/` as
/// `<udid>-<hostId>.pem`, regenerating at most every three minutes.
pub fn write_pem_cache(record: &PairRecord, udid: &str) -> Result<PathBuf, DeviceError> {
    let _guard = PEM_LOCK.lock().unwrap();
    let dir = crate::util::app_dir("ssl")?;
    let path = dir.join(format!("{}-{}.pem", udid, record.host_id));

    if let Ok(meta) = std::fs::metadata(&path) {
        if let Ok(mtime) = meta.modified() {
            if mtime.elapsed().unwrap_or_default() < PEM_REFRESH_WINDOW {
                return Ok(path);
            }
        }
    }

    let mut file = std::fs::File::create(&path)?;
    file.write_all(&record.host_private_key.private_key_to_pem_pkcs8()?)?;
    file.write_all(b"\n")?;
    file.write_all(&record.host_certificate.to_pem()?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca;

    fn sample_record() -> PairRecord {
        let device_rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let device_pub = device_rsa.public_key_to_pem_pkcs1().unwrap();
        let certs = ca::generate_pair_certs(&device_pub).unwrap();
        PairRecord {
            device_certificate: certs.device_certificate,
            host_certificate: certs.host_certificate.clone(),
            host_private_key: certs.host_private_key.clone(),
            root_certificate: certs.host_certificate,
            root_private_key: Some(certs.host_private_key),
            host_id: "EC5AA8A6-2B59-4B86-9E41-E0C971A20E47".to_string(),
            system_buid: "2B3CBB4C-7866-4E6A-9207-D7A6C4A76A0B".to_string(),
            escrow_bag: Some(vec![1, 2, 3]),
            wifi_mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
        }
    }

    #[test]
    fn record_round_trips_through_plist() {
        let record = sample_record();
        let bytes = record.serialize().unwrap();
        let parsed = PairRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.host_id, record.host_id);
        assert_eq!(parsed.system_buid, record.system_buid);
        assert_eq!(parsed.escrow_bag, record.escrow_bag);
        assert_eq!(parsed.wifi_mac_address, record.wifi_mac_address);
        assert_eq!(
            parsed.host_certificate.to_pem().unwrap(),
            record.host_certificate.to_pem().unwrap()
        );
    }
}
