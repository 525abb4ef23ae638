//! Client for the host-side usbmuxd daemon.
//!
//! Every message to the daemon is a 16-byte little-endian header
//! (`length, version, type, tag`) followed by an XML property list; the
//! daemon replies in the same shape. A successful `Connect` turns the
//! socket into a transparent byte pipe to the device, at which point it is
//! handed off to [`crate::DeviceStream`].

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, warn};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::pairing::PairRecord;
use crate::{DeviceError, ReadWrite, PROGRAM_NAME};

/// Version string reported to the daemon, matching the reference client.
const CLIENT_VERSION: &str = "libusbmuxd 1.1.0";
const MUX_VERSION: u32 = 3;

const PLIST_VERSION: u32 = 1;
const PLIST_MESSAGE_TYPE: u32 = 8;

/// Environment variable overriding the mux endpoint.
pub const MUX_ENV: &str = "TMQ_USBMUX";

/// Result codes the daemon embeds in `Result` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ok,
    BadCommand,
    BadDevice,
    ConnectionRefused,
    BadVersion,
    Other(u64),
}

impl From<u64> for ReplyCode {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::BadCommand,
            2 => Self::BadDevice,
            3 => Self::ConnectionRefused,
            6 => Self::BadVersion,
            other => Self::Other(other),
        }
    }
}

/// How a device is attached to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Usb,
    Network,
    Other(String),
}

/// One attached device as reported by the daemon.
///
/// `device_id` is only valid for the lifetime of the attachment and must be
/// re-resolved after a reconnect; identity is the udid.
#[derive(Debug, Clone, Eq)]
pub struct DeviceRecord {
    pub udid: String,
    pub device_id: u32,
    pub connection: ConnectionKind,
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.udid == other.udid
    }
}

/// Event from a streaming `Listen` request.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    Attached(DeviceRecord),
    Detached(u32),
    Paired(u32),
}

/// Where the daemon listens.
#[derive(Debug, Clone)]
pub enum UsbmuxAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl UsbmuxAddr {
    /// Platform default, overridable with `TMQ_USBMUX`. A value containing
    /// `:` is treated as `host:port`, anything else as a socket path.
    pub fn from_env() -> Self {
        if let Ok(addr) = std::env::var(MUX_ENV) {
            debug!("using mux endpoint from {MUX_ENV}: {addr}");
            return if addr.contains(':') {
                Self::Tcp(addr)
            } else {
                Self::Unix(PathBuf::from(addr))
            };
        }
        if cfg!(windows) {
            Self::Tcp("127.0.0.1:27015".to_string())
        } else {
            Self::Unix(PathBuf::from("/var/run/usbmuxd"))
        }
    }

    /// Opens a fresh framed socket to the daemon.
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxConnection, DeviceError> {
        let socket: Box<dyn ReadWrite> = match self {
            #[cfg(unix)]
            Self::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            Self::Unix(_) => {
                return Err(DeviceError::Socket(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
            Self::Tcp(addr) => Box::new(tokio::net::TcpStream::connect(addr.as_str()).await?),
        };
        Ok(UsbmuxConnection::new(socket, tag))
    }
}

/// A single framed connection to the daemon.
///
/// The daemon answers exactly one request per connection, except `Listen`
/// (streaming) and `Connect` (which converts the socket into a pipe), so
/// callers open a fresh connection per operation.
#[derive(Debug)]
pub struct UsbmuxConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(rename = "DeviceList")]
    device_list: Vec<ListEntry>,
}

#[derive(Deserialize)]
struct ListEntry {
    #[serde(rename = "Properties")]
    properties: EntryProperties,
}

#[derive(Deserialize)]
struct EntryProperties {
    #[serde(rename = "ConnectionType")]
    connection_type: String,
    #[serde(rename = "DeviceID")]
    device_id: u32,
    #[serde(rename = "SerialNumber")]
    serial_number: String,
}

impl UsbmuxConnection {
    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    fn base_request(&self, message_type: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), message_type.into());
        req.insert("ClientVersionString".into(), CLIENT_VERSION.into());
        req.insert("ProgName".into(), PROGRAM_NAME.into());
        req.insert("kLibUSBMuxVersion".into(), MUX_VERSION.into());
        req
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), DeviceError> {
        let mut body = Vec::new();
        plist::Value::Dictionary(req).to_writer_xml(&mut body)?;

        let mut buf = Vec::with_capacity(16 + body.len());
        buf.extend_from_slice(&((16 + body.len()) as u32).to_le_bytes());
        buf.extend_from_slice(&PLIST_VERSION.to_le_bytes());
        buf.extend_from_slice(&PLIST_MESSAGE_TYPE.to_le_bytes());
        buf.extend_from_slice(&self.tag.to_le_bytes());
        buf.extend_from_slice(&body);
        self.socket.write_all(&buf).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let mut header = [0u8; 16];
        self.socket.read_exact(&mut header).await?;
        let len = u32::from_le_bytes(header[..4].try_into().unwrap());
        if len < 16 {
            return Err(DeviceError::UnexpectedResponse);
        }
        let mut body = vec![0; len as usize - 16];
        self.socket.read_exact(&mut body).await?;
        let res: plist::Dictionary = plist::from_bytes(&body)?;
        debug!("mux reply: {res:?}");
        Ok(res)
    }

    /// Raises when a reply carries a non-zero `Number`.
    fn check(res: &plist::Dictionary) -> Result<(), DeviceError> {
        if let Some(n) = res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            if n != 0 {
                return Err(DeviceError::MuxReply(ReplyCode::from(n)));
            }
        }
        Ok(())
    }

    async fn request(
        &mut self,
        req: plist::Dictionary,
    ) -> Result<plist::Dictionary, DeviceError> {
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check(&res)?;
        Ok(res)
    }

    /// Lists attached devices, collapsing duplicates by udid with USB
    /// entries winning over network ones.
    pub async fn list_devices(&mut self) -> Result<Vec<DeviceRecord>, DeviceError> {
        let req = self.base_request("ListDevices");
        let res = self.request(req).await?;
        let res: ListResponse = plist::from_value(&plist::Value::Dictionary(res))?;

        let mut order = Vec::new();
        let mut by_udid: HashMap<String, DeviceRecord> = HashMap::new();
        for entry in res.device_list {
            let p = entry.properties;
            let connection = match p.connection_type.as_str() {
                "USB" => ConnectionKind::Usb,
                "Network" => ConnectionKind::Network,
                other => ConnectionKind::Other(other.to_string()),
            };
            let record = DeviceRecord {
                udid: p.serial_number.clone(),
                device_id: p.device_id,
                connection,
            };
            match by_udid.get(&p.serial_number) {
                None => {
                    order.push(p.serial_number.clone());
                    by_udid.insert(p.serial_number, record);
                }
                Some(existing) => {
                    if existing.connection != ConnectionKind::Usb
                        && record.connection == ConnectionKind::Usb
                    {
                        by_udid.insert(p.serial_number, record);
                    }
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|udid| by_udid.remove(&udid))
            .collect())
    }

    /// Reads the host-global BUID.
    pub async fn read_buid(&mut self) -> Result<String, DeviceError> {
        let req = self.base_request("ReadBUID");
        let mut res = self.request(req).await?;
        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Fetches the stored pair record for a device.
    pub async fn read_pair_record(&mut self, udid: &str) -> Result<PairRecord, DeviceError> {
        let mut req = self.base_request("ReadPairRecord");
        req.insert("PairRecordID".into(), udid.into());
        let res = self.request(req).await?;
        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairRecord::from_bytes(d),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Stores a pair record with the daemon. Idempotent write-through.
    pub async fn save_pair_record(
        &mut self,
        udid: &str,
        record: &PairRecord,
        device_id: u32,
    ) -> Result<(), DeviceError> {
        let mut req = self.base_request("SavePairRecord");
        req.insert("PairRecordID".into(), udid.into());
        req.insert(
            "PairRecordData".into(),
            plist::Value::Data(record.serialize()?),
        );
        req.insert("DeviceID".into(), device_id.into());
        self.request(req).await?;
        Ok(())
    }

    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), DeviceError> {
        let mut req = self.base_request("DeletePairRecord");
        req.insert("PairRecordID".into(), udid.into());
        self.request(req).await?;
        Ok(())
    }

    /// Subscribes to attach/detach events. The returned watcher owns the
    /// socket; dropping it cancels the stream.
    pub async fn listen(mut self) -> Result<DeviceWatcher, DeviceError> {
        let req = self.base_request("Listen");
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check(&res)?;
        Ok(DeviceWatcher { conn: self })
    }

    /// Asks the daemon to patch this socket through to a device TCP port.
    ///
    /// The port travels in network byte order while the header stays
    /// little-endian, hence the explicit swap.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, DeviceError> {
        let mut req = self.base_request("Connect");
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), (port.swap_bytes() as u64).into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check(&res)?;
        debug!("mux pipe open to device {device_id} port {port}");
        Ok(self.socket)
    }
}

/// Live `Listen` subscription.
#[derive(Debug)]
pub struct DeviceWatcher {
    conn: UsbmuxConnection,
}

impl DeviceWatcher {
    /// Waits for the next attach/detach/pair event.
    pub async fn next_event(&mut self) -> Result<MuxEvent, DeviceError> {
        loop {
            let res = self.conn.read_plist().await?;
            let device_id = res
                .get("DeviceID")
                .and_then(|x| x.as_unsigned_integer())
                .unwrap_or(0) as u32;
            match res.get("MessageType").and_then(|x| x.as_string()) {
                Some("Attached") => {
                    let properties = match res.get("Properties") {
                        Some(p) => p.clone(),
                        None => continue,
                    };
                    let p: EntryProperties = plist::from_value(&properties)?;
                    let connection = match p.connection_type.as_str() {
                        "USB" => ConnectionKind::Usb,
                        "Network" => ConnectionKind::Network,
                        other => ConnectionKind::Other(other.to_string()),
                    };
                    return Ok(MuxEvent::Attached(DeviceRecord {
                        udid: p.serial_number,
                        device_id: p.device_id,
                        connection,
                    }));
                }
                Some("Detached") => return Ok(MuxEvent::Detached(device_id)),
                Some("Paired") => return Ok(MuxEvent::Paired(device_id)),
                other => {
                    warn!("unknown mux event: {other:?}");
                }
            }
        }
    }
}
