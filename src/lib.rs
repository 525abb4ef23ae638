//! Client library for iOS devices reached through the usbmuxd multiplexer.
//!
//! The entry point is [`Device`], which owns the mux endpoint and a device
//! identity and hands out connected service clients: [`lockdown`],
//! [`afc`], [`installation`], [`mounter`], [`instruments`] and the
//! [`xctest`] driver.

use std::io::{self, BufWriter};
use std::pin::Pin;
use std::time::Duration;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use log::{debug, trace};

pub mod afc;
pub mod ca;
pub mod crash;
pub mod device;
pub mod dtx;
pub mod house_arrest;
pub mod installation;
pub mod instruments;
pub mod lockdown;
pub mod mounter;
pub mod nskeyed;
pub mod pairing;
pub mod screenshot;
pub mod syslog;
pub mod usbmux;
pub(crate) mod util;
pub mod xctest;

pub use device::Device;
pub use pairing::PairRecord;

/// TCP port of the always-on lockdown service on the device.
pub const LOCKDOWN_PORT: u16 = 62078;

/// Label sent with every request so the device can attribute the client.
pub const PROGRAM_NAME: &str = "tmqdevice";

/// Default timeout for a property-list request/reply exchange.
pub const PLIST_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a device transport needs: async IO, thread mobility, Debug.
///
/// Tokio's `TcpStream`, `UnixStream` and in-memory duplex pipes all qualify.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// How a service socket should be upgraded to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// All traffic after the handshake is encrypted.
    Full,
    /// Handshake only. The device uses TLS as an authorization gate for a
    /// few services and then expects plaintext on the same socket; the
    /// session state is discarded after the handshake succeeds.
    DialOnly,
}

/// A framed property-list stream to one service on the device.
///
/// Messages are a 4-byte big-endian length followed by an XML or binary
/// property list. The underlying socket is boxed so mux pipes, plain TCP
/// and TLS-wrapped sockets all flow through the same client code.
#[derive(Debug)]
pub struct DeviceStream {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
    reply_timeout: Option<Duration>,
}

impl DeviceStream {
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            reply_timeout: Some(PLIST_REPLY_TIMEOUT),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Overrides the reply timeout. `None` waits forever; the image
    /// mounter uses that while the device digests a pushed image.
    pub fn set_reply_timeout(&mut self, timeout: Option<Duration>) {
        self.reply_timeout = timeout;
    }

    /// Gives up the underlying socket, e.g. to hand it to the DTX bus.
    pub fn into_socket(mut self) -> Result<Box<dyn ReadWrite>, DeviceError> {
        self.socket.take().ok_or(DeviceError::NoEstablishedConnection)
    }

    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending plist: {message:?}");
            let buf = Vec::new();
            let mut writer = BufWriter::new(buf);
            message.to_writer_xml(&mut writer)?;
            let message = writer.into_inner().unwrap();
            socket.write_all(&(message.len() as u32).to_be_bytes()).await?;
            socket.write_all(&message).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(DeviceError::NoEstablishedConnection)
        }
    }

    /// Reads one framed plist, without interpreting it.
    pub(crate) async fn read_plist_value(&mut self) -> Result<plist::Value, DeviceError> {
        let timeout = self.reply_timeout;
        let socket = self
            .socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)?;

        let read = async {
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await?;
            let len = u32::from_be_bytes(buf);
            let mut buf = vec![0; len as usize];
            socket.read_exact(&mut buf).await?;
            Ok::<Vec<u8>, io::Error>(buf)
        };
        let buf = match timeout {
            Some(t) => tokio::time::timeout(t, read)
                .await
                .map_err(|_| DeviceError::Timeout)??,
            None => read.await?,
        };
        let res: plist::Value = plist::from_bytes(&buf)?;
        trace!("Received plist: {res:?}");
        Ok(res)
    }

    /// Reads one framed plist dictionary and raises any device-side error
    /// carried in its `Error` key.
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let res = self.read_plist_value().await?;
        let res: plist::Dictionary = plist::from_value(&res)?;

        if let Some(e) = res.get("Error") {
            let e: String = plist::from_value(e)?;
            return Err(match DeviceError::from_device_error(&e) {
                Some(e) => e,
                None => {
                    let msg = match res.get("ErrorDescription").and_then(|x| x.as_string()) {
                        Some(desc) => format!("{e} ({desc})"),
                        None => e,
                    };
                    DeviceError::ServiceFailure(msg)
                }
            });
        }
        Ok(res)
    }

    /// Writes bytes without framing. Used for AFC frames and image pushes.
    pub(crate) async fn send_raw(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        if let Some(socket) = &mut self.socket {
            socket.write_all(message).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(DeviceError::NoEstablishedConnection)
        }
    }

    /// Reads exactly `len` unframed bytes.
    pub(crate) async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DeviceError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = vec![0; len];
            socket.read_exact(&mut buf).await?;
            Ok(buf)
        } else {
            Err(DeviceError::NoEstablishedConnection)
        }
    }

    /// Reads whatever is available, up to `max`. Used by the raw relays.
    pub(crate) async fn read_some(&mut self, max: usize) -> Result<Vec<u8>, DeviceError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = vec![0; max];
            let n = socket.read(&mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        } else {
            Err(DeviceError::NoEstablishedConnection)
        }
    }

    /// Upgrades the socket to TLS with the pair-record credentials.
    ///
    /// The device presents a certificate signed by the host during pairing
    /// and expects the host certificate as the client credential; hostname
    /// verification is meaningless here and old devices only speak legacy
    /// cipher suites, so verification is disabled and the security level
    /// relaxed.
    pub async fn enable_tls(
        &mut self,
        pairing: &PairRecord,
        mode: TlsMode,
    ) -> Result<(), DeviceError> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_certificate(&pairing.host_certificate)?;
        builder.set_private_key(&pairing.host_private_key)?;
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_min_proto_version(Some(SslVersion::TLS1))?;
        builder.set_security_level(0);
        let connector = builder.build();
        let mut config = connector.configure()?;
        config.set_verify_hostname(false);
        let ssl = config.into_ssl("Device")?;

        match mode {
            TlsMode::Full => {
                let socket = self
                    .socket
                    .take()
                    .ok_or(DeviceError::NoEstablishedConnection)?;
                let mut stream = tokio_openssl::SslStream::new(ssl, socket)?;
                Pin::new(&mut stream).connect().await?;
                self.socket = Some(Box::new(stream));
            }
            TlsMode::DialOnly => {
                let socket = self
                    .socket
                    .as_mut()
                    .ok_or(DeviceError::NoEstablishedConnection)?;
                // Handshake over a borrow of the raw socket; dropping the
                // stream afterwards leaves the plaintext pipe untouched and
                // sends no close-notify.
                let mut stream = tokio_openssl::SslStream::new(ssl, socket)?;
                Pin::new(&mut stream).connect().await?;
            }
        }
        debug!("TLS session established ({mode:?})");
        Ok(())
    }
}

/// Error type shared by every layer of the crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS handshake failed")]
    Tls(#[from] openssl::ssl::Error),
    #[error("TLS setup failed")]
    TlsSetup(#[from] openssl::error::ErrorStack),
    #[error("property list io failed")]
    Plist(#[from] plist::Error),
    #[error("bytes are not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("mux daemon rejected the request: {0:?}")]
    MuxReply(usbmux::ReplyCode),
    #[error("no device matched the requested identity")]
    DeviceNotFound,
    #[error("device returned error `{0}`")]
    ServiceFailure(String),
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no session is active")]
    SessionInactive,
    #[error("device does not recognize the host pairing")]
    InvalidHostId,
    #[error("requested service is not available")]
    InvalidService,
    #[error("device is password protected; unlock before pairing")]
    PasswordProtected,
    #[error("pairing dialog is awaiting a response on the device")]
    PairingDialogResponsePending,
    #[error("user denied the pairing request")]
    UserDeniedPairing,
    #[error("device is locked")]
    DeviceLocked,
    #[error("installation failed: {0}")]
    InstallationFailed(String),
    #[error("afc operation failed: {0}")]
    Afc(afc::AfcStatus),
    #[error("afc reply carried unknown operation {0:#x}")]
    UnknownAfcOperation(u64),
    #[error("afc frame has a bad magic")]
    InvalidAfcMagic,
    #[error("afc stat reply is missing `{0}`")]
    AfcMissingAttribute(&'static str),
    #[error("malformed DTX data: {0}")]
    DtxDecode(String),
    #[error("archived object class `{0}` is not supported")]
    UnsupportedArchiveClass(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("developer disk image not found; looked in {0}")]
    DeveloperImageNotFound(String),
}

impl DeviceError {
    /// Maps a device-reported error string onto a typed error.
    pub(crate) fn from_device_error(e: &str) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "SessionInactive" => Some(Self::SessionInactive),
            "InvalidHostID" => Some(Self::InvalidHostId),
            "InvalidService" => Some(Self::InvalidService),
            "PasswordProtected" => Some(Self::PasswordProtected),
            "PairingDialogResponsePending" => Some(Self::PairingDialogResponsePending),
            "UserDeniedPairing" => Some(Self::UserDeniedPairing),
            "DeviceLocked" => Some(Self::DeviceLocked),
            _ => None,
        }
    }
}
