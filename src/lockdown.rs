//! Client for the lockdown service on device TCP port 62078.
//!
//! Lockdown authenticates the host, answers property queries and starts
//! every other named service. The session dance is always the same:
//! `QueryType`, a pre-session `GetValue`, `StartSession` with the pair
//! record identity, then an optional TLS upgrade on the same socket.

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::ca;
use crate::pairing::PairRecord;
use crate::{DeviceError, DeviceStream, TlsMode};

/// Services that perform a TLS handshake purely as an authorization gate
/// and then revert to plaintext on the same socket.
pub const DIAL_ONLY_SERVICES: [&str; 4] = [
    "com.apple.instruments.remoteserver",
    "com.apple.debugserver",
    "com.apple.testmanagerd.lockdown",
    "com.apple.accessibility.axAuditDaemon.remoteserver",
];

/// Result of `StartService`: consumed immediately by opening a fresh mux
/// pipe to `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
    pub ssl: bool,
    /// TLS handshake then plaintext (see [`DIAL_ONLY_SERVICES`]).
    pub dial_only: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LockdownRequest {
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    request: String,
}

/// Client for one lockdown conversation.
#[derive(Debug)]
pub struct LockdownClient {
    pub stream: DeviceStream,
    session_id: Option<String>,
}

impl LockdownClient {
    pub fn new(stream: DeviceStream) -> Self {
        Self {
            stream,
            session_id: None,
        }
    }

    fn request(&self, request: &str, key: Option<String>, domain: Option<String>) -> LockdownRequest {
        LockdownRequest {
            label: self.stream.label().to_string(),
            key,
            domain,
            request: request.to_string(),
        }
    }

    /// Asks the service to identify itself; lockdown answers
    /// `com.apple.mobile.lockdown`.
    pub async fn query_type(&mut self) -> Result<String, DeviceError> {
        let req = self.request("QueryType", None, None);
        self.stream.send_plist(plist::to_value(&req)?).await?;
        let res = self.stream.read_plist().await?;
        match res.get("Type") {
            Some(t) => Ok(plist::from_value(t)?),
            None => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Fetches one value, or the whole dictionary when `key` is `None`.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<plist::Value, DeviceError> {
        let req = self.request(
            "GetValue",
            key.map(str::to_string),
            domain.map(str::to_string),
        );
        self.stream.send_plist(plist::to_value(&req)?).await?;
        let mut res = self.stream.read_plist().await?;
        match res.remove("Value") {
            Some(v) => Ok(v),
            None => Err(DeviceError::UnexpectedResponse),
        }
    }

    pub async fn get_all_values(
        &mut self,
        domain: Option<&str>,
    ) -> Result<plist::Dictionary, DeviceError> {
        match self.get_value(None, domain).await? {
            plist::Value::Dictionary(d) => Ok(d),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    pub async fn set_value(
        &mut self,
        key: &str,
        value: plist::Value,
        domain: Option<&str>,
    ) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.stream.label().into());
        req.insert("Request".into(), "SetValue".into());
        req.insert("Key".into(), key.into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;
        self.stream.read_plist().await?;
        Ok(())
    }

    /// Negotiates an authenticated session and, when the device asks for
    /// it, upgrades this socket to TLS with the pair-record credentials.
    ///
    /// At most one session exists per socket; calling this twice without a
    /// `StopSession` is a protocol error the device will reject.
    pub async fn start_session(&mut self, record: &PairRecord) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.stream.label().into());
        req.insert("Request".into(), "StartSession".into());
        req.insert("HostID".into(), record.host_id.clone().into());
        req.insert("SystemBUID".into(), record.system_buid.clone().into());
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.stream.read_plist().await?;
        let session_id = match res.get("SessionID").and_then(|x| x.as_string()) {
            Some(s) => s.to_string(),
            None => return Err(DeviceError::UnexpectedResponse),
        };
        let ssl = res
            .get("EnableSessionSSL")
            .and_then(|x| x.as_boolean())
            .unwrap_or(false);
        debug!("session {session_id} started, ssl={ssl}");

        if ssl {
            self.stream.enable_tls(record, TlsMode::Full).await?;
        }
        self.session_id = Some(session_id);
        Ok(())
    }

    pub async fn stop_session(&mut self) -> Result<(), DeviceError> {
        let session_id = match self.session_id.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.stream.label().into());
        req.insert("Request".into(), "StopSession".into());
        req.insert("SessionID".into(), session_id.into());
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;
        self.stream.read_plist().await?;
        Ok(())
    }

    /// Asks lockdown to start a named service.
    pub async fn start_service(
        &mut self,
        name: impl Into<String>,
    ) -> Result<ServiceEndpoint, DeviceError> {
        let name = name.into();
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.stream.label().into());
        req.insert("Request".into(), "StartService".into());
        req.insert("Service".into(), name.clone().into());
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.stream.read_plist().await?;

        // Absent over USB on some versions; absent means plaintext.
        let ssl = res
            .get("EnableServiceSSL")
            .and_then(|x| x.as_boolean())
            .unwrap_or(false);
        let port = match res.get("Port").and_then(|x| x.as_unsigned_integer()) {
            Some(p) if p <= u16::MAX as u64 => p as u16,
            _ => {
                error!("StartService reply had no usable port: {res:?}");
                return Err(DeviceError::UnexpectedResponse);
            }
        };
        let dial_only = ssl && DIAL_ONLY_SERVICES.contains(&name.as_str());
        Ok(ServiceEndpoint {
            name,
            port,
            ssl,
            dial_only,
        })
    }

    /// Runs the pairing protocol and returns the new pair record.
    ///
    /// Device-side outcomes that need user interaction
    /// (`PasswordProtected`, `PairingDialogResponsePending`) surface
    /// verbatim; retry policy belongs to the caller.
    pub async fn pair(
        &mut self,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
    ) -> Result<PairRecord, DeviceError> {
        let host_id = host_id.into().to_uppercase();
        let system_buid = system_buid.into();

        let device_public_key = match self
            .get_value(Some("DevicePublicKey"), None)
            .await?
            .as_data()
        {
            Some(k) => k.to_vec(),
            None => return Err(DeviceError::UnexpectedResponse),
        };
        let wifi_mac = self
            .get_value(Some("WiFiAddress"), None)
            .await
            .ok()
            .and_then(|v| v.as_string().map(str::to_string));

        let certs = ca::generate_pair_certs(&device_public_key)?;

        let mut pair_record = plist::Dictionary::new();
        pair_record.insert(
            "DevicePublicKey".into(),
            plist::Value::Data(device_public_key),
        );
        pair_record.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(certs.device_certificate.to_pem()?),
        );
        pair_record.insert(
            "HostCertificate".into(),
            plist::Value::Data(certs.host_certificate.to_pem()?),
        );
        pair_record.insert(
            "RootCertificate".into(),
            plist::Value::Data(certs.host_certificate.to_pem()?),
        );
        pair_record.insert("HostID".into(), host_id.clone().into());
        pair_record.insert("SystemBUID".into(), system_buid.clone().into());

        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.stream.label().into());
        req.insert("Request".into(), "Pair".into());
        req.insert("PairRecord".into(), plist::Value::Dictionary(pair_record));
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("PairingOptions".into(), plist::Value::Dictionary(options));
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.stream.read_plist().await?;
        let escrow_bag = res
            .get("EscrowBag")
            .and_then(|x| x.as_data())
            .map(|x| x.to_vec());

        Ok(PairRecord {
            device_certificate: certs.device_certificate,
            host_certificate: certs.host_certificate.clone(),
            host_private_key: certs.host_private_key.clone(),
            root_certificate: certs.host_certificate,
            root_private_key: Some(certs.host_private_key),
            host_id,
            system_buid,
            escrow_bag,
            wifi_mac_address: wifi_mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROGRAM_NAME;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_frame(sock: &mut tokio::io::DuplexStream) -> plist::Dictionary {
        let mut len = [0u8; 4];
        sock.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        sock.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    async fn write_frame(sock: &mut tokio::io::DuplexStream, body: plist::Dictionary) {
        let mut xml = Vec::new();
        plist::Value::Dictionary(body)
            .to_writer_xml(&mut xml)
            .unwrap();
        sock.write_all(&(xml.len() as u32).to_be_bytes())
            .await
            .unwrap();
        sock.write_all(&xml).await.unwrap();
    }

    #[tokio::test]
    async fn start_service_marks_dial_only_names() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let req = read_frame(&mut server).await;
            assert_eq!(
                req.get("Request").and_then(|x| x.as_string()),
                Some("StartService")
            );
            assert_eq!(
                req.get("Service").and_then(|x| x.as_string()),
                Some("com.apple.instruments.remoteserver")
            );
            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "StartService".into());
            res.insert("Service".into(), "com.apple.instruments.remoteserver".into());
            res.insert("Port".into(), 53428u64.into());
            res.insert("EnableServiceSSL".into(), true.into());
            write_frame(&mut server, res).await;
        });

        let stream = DeviceStream::new(Box::new(client), PROGRAM_NAME);
        let mut lockdown = LockdownClient::new(stream);
        let endpoint = lockdown
            .start_service("com.apple.instruments.remoteserver")
            .await
            .unwrap();
        server_task.await.unwrap();

        assert_eq!(endpoint.port, 53428);
        assert!(endpoint.ssl);
        assert!(endpoint.dial_only);
    }

    #[tokio::test]
    async fn start_service_plain_for_ordinary_names() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            let mut res = plist::Dictionary::new();
            res.insert("Port".into(), 1234u64.into());
            res.insert("EnableServiceSSL".into(), true.into());
            write_frame(&mut server, res).await;
        });

        let stream = DeviceStream::new(Box::new(client), PROGRAM_NAME);
        let mut lockdown = LockdownClient::new(stream);
        let endpoint = lockdown.start_service("com.apple.afc").await.unwrap();
        server_task.await.unwrap();
        assert!(endpoint.ssl);
        assert!(!endpoint.dial_only);
    }

    #[tokio::test]
    async fn invalid_service_error_is_typed() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            let mut res = plist::Dictionary::new();
            res.insert("Error".into(), "InvalidService".into());
            write_frame(&mut server, res).await;
        });

        let stream = DeviceStream::new(Box::new(client), PROGRAM_NAME);
        let mut lockdown = LockdownClient::new(stream);
        let err = lockdown
            .start_service("com.apple.mobile.screenshotr")
            .await
            .unwrap_err();
        server_task.await.unwrap();
        assert!(matches!(err, DeviceError::InvalidService));
    }

    #[tokio::test]
    async fn get_value_unwraps_value_key() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let req = read_frame(&mut server).await;
            assert_eq!(
                req.get("Key").and_then(|x| x.as_string()),
                Some("ProductVersion")
            );
            let mut res = plist::Dictionary::new();
            res.insert("Key".into(), "ProductVersion".into());
            res.insert("Request".into(), "GetValue".into());
            res.insert("Value".into(), "13.4.1".into());
            write_frame(&mut server, res).await;
        });

        let stream = DeviceStream::new(Box::new(client), PROGRAM_NAME);
        let mut lockdown = LockdownClient::new(stream);
        let value = lockdown
            .get_value(Some("ProductVersion"), None)
            .await
            .unwrap();
        server_task.await.unwrap();
        assert_eq!(value.as_string(), Some("13.4.1"));
    }
}
