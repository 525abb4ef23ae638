//! The device handle: identity plus the mux endpoint, and the recipes that
//! turn a service name into a connected client.
//!
//! Every service bring-up funnels through lockdown on port 62078: open a
//! mux pipe, authenticate, `StartService`, then open a second mux pipe to
//! the returned port and upgrade it to TLS when asked. The handle also owns
//! the pair-record lifecycle, including the one-shot recovery paths the
//! protocol demands (re-pair on `InvalidHostID`, mount the developer image
//! on `InvalidService`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::afc::AfcClient;
use crate::crash::CrashReportClient;
use crate::dtx::DtxConnection;
use crate::house_arrest;
use crate::installation::InstallationProxyClient;
use crate::instruments::InstrumentsClient;
use crate::lockdown::LockdownClient;
use crate::mounter::ImageMounterClient;
use crate::pairing::{self, PairRecord};
use crate::screenshot::ScreenshotClient;
use crate::syslog::SyslogRelayClient;
use crate::usbmux::{DeviceRecord, ReplyCode, UsbmuxAddr, UsbmuxConnection};
use crate::{DeviceError, DeviceStream, TlsMode, LOCKDOWN_PORT, PROGRAM_NAME};

/// Environment variable selecting a device when several are attached.
pub const UDID_ENV: &str = "TMQ_DEVICE_UDID";

/// Disk capacity and usage, in bytes. The device reports decimal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub disk_size: u64,
    pub used: u64,
    pub free: u64,
}

/// Screen geometry from the device's media domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenInfo {
    pub width: u64,
    pub height: u64,
    pub scale: f64,
}

/// Handle to one attached device.
///
/// Owns the mux endpoint explicitly; nothing here is process-global except
/// the PEM cache file mandated by the on-disk layout.
#[derive(Debug)]
pub struct Device {
    udid: String,
    mux_addr: UsbmuxAddr,
    label: String,
    tag: AtomicU32,
    device_id: Mutex<Option<u32>>,
    pair_record: Mutex<Option<PairRecord>>,
    product_version: Mutex<Option<String>>,
}

impl Device {
    /// Lists attached devices on the default (or overridden) mux endpoint.
    pub async fn list() -> Result<Vec<DeviceRecord>, DeviceError> {
        let addr = UsbmuxAddr::from_env();
        let mut mux = addr.connect(1).await?;
        mux.list_devices().await
    }

    /// Opens a handle, resolving the udid from the argument, the
    /// `TMQ_DEVICE_UDID` environment variable, or the single attached
    /// device, in that order.
    pub async fn new(udid: Option<&str>) -> Result<Self, DeviceError> {
        let addr = UsbmuxAddr::from_env();
        let requested = match udid {
            Some(u) => Some(u.to_string()),
            None => std::env::var(UDID_ENV).ok(),
        };

        let mut mux = addr.connect(1).await?;
        let devices = mux.list_devices().await?;
        let record = match &requested {
            Some(u) => devices.into_iter().find(|d| &d.udid == u),
            None => {
                if devices.len() == 1 {
                    devices.into_iter().next()
                } else {
                    None
                }
            }
        }
        .ok_or(DeviceError::DeviceNotFound)?;

        let device = Self::with_mux(addr, record.udid);
        *device.device_id.lock().await = Some(record.device_id);
        Ok(device)
    }

    /// Builds a handle for a known udid without touching the daemon.
    pub fn with_mux(mux_addr: UsbmuxAddr, udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            mux_addr,
            label: PROGRAM_NAME.to_string(),
            tag: AtomicU32::new(1),
            device_id: Mutex::new(None),
            pair_record: Mutex::new(None),
            product_version: Mutex::new(None),
        }
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    fn next_tag(&self) -> u32 {
        self.tag.fetch_add(1, Ordering::Relaxed)
    }

    async fn mux(&self) -> Result<UsbmuxConnection, DeviceError> {
        self.mux_addr.connect(self.next_tag()).await
    }

    /// Daemon-assigned id for the current attachment. Resolved lazily and
    /// dropped whenever the daemon stops recognizing it.
    pub async fn device_id(&self) -> Result<u32, DeviceError> {
        let mut cached = self.device_id.lock().await;
        if let Some(id) = *cached {
            return Ok(id);
        }
        let mut mux = self.mux().await?;
        let devices = mux.list_devices().await?;
        let record = devices
            .into_iter()
            .find(|d| d.udid == self.udid)
            .ok_or(DeviceError::DeviceNotFound)?;
        *cached = Some(record.device_id);
        Ok(record.device_id)
    }

    /// Opens a raw mux pipe to a device TCP port.
    pub async fn connect_port(&self, port: u16) -> Result<DeviceStream, DeviceError> {
        let device_id = self.device_id().await?;
        let mux = self.mux().await?;
        let socket = match mux.connect_to_device(device_id, port).await {
            Ok(s) => s,
            Err(DeviceError::MuxReply(ReplyCode::BadDevice)) => {
                // Stale attachment id; resolve again and retry once.
                *self.device_id.lock().await = None;
                let device_id = self.device_id().await?;
                let mux = self.mux().await?;
                mux.connect_to_device(device_id, port).await?
            }
            Err(e) => return Err(e),
        };
        Ok(DeviceStream::new(socket, self.label.clone()))
    }

    /// Loads the pair record from the cache or the daemon.
    pub async fn pair_record(&self) -> Result<PairRecord, DeviceError> {
        {
            let cached = self.pair_record.lock().await;
            if let Some(record) = cached.as_ref() {
                return Ok(record.clone());
            }
        }
        let mut mux = self.mux().await?;
        let record = mux.read_pair_record(&self.udid).await?;
        if let Err(e) = pairing::write_pem_cache(&record, &self.udid) {
            warn!("could not refresh pem cache: {e}");
        }
        *self.pair_record.lock().await = Some(record.clone());
        Ok(record)
    }

    /// Runs the pairing protocol on an open lockdown connection and stores
    /// the result with the daemon.
    async fn pair_and_save(
        &self,
        lockdown: &mut LockdownClient,
    ) -> Result<PairRecord, DeviceError> {
        let mut mux = self.mux().await?;
        let buid = mux.read_buid().await?;
        let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        info!("pairing with {} as {host_id}", self.udid);

        let record = lockdown.pair(host_id, buid).await?;

        let device_id = self.device_id().await?;
        let mut mux = self.mux().await?;
        mux.save_pair_record(&self.udid, &record, device_id).await?;
        if let Err(e) = pairing::write_pem_cache(&record, &self.udid) {
            warn!("could not refresh pem cache: {e}");
        }
        *self.pair_record.lock().await = Some(record.clone());
        Ok(record)
    }

    /// Opens an authenticated (and usually TLS-upgraded) lockdown session.
    ///
    /// Recovery rules: a missing pair record triggers pairing; an
    /// `InvalidHostID` rejection deletes the stale record, re-pairs and
    /// retries `StartSession` exactly once.
    pub async fn lockdown_session(&self) -> Result<LockdownClient, DeviceError> {
        let stream = self.connect_port(LOCKDOWN_PORT).await?;
        let mut lockdown = LockdownClient::new(stream);

        let service_type = lockdown.query_type().await?;
        if service_type != "com.apple.mobile.lockdown" {
            warn!("unexpected lockdown type: {service_type}");
            return Err(DeviceError::UnexpectedResponse);
        }

        if let Some(version) = lockdown
            .get_value(Some("ProductVersion"), None)
            .await?
            .as_string()
        {
            *self.product_version.lock().await = Some(version.to_string());
        }

        let record = match self.pair_record().await {
            Ok(r) => r,
            Err(DeviceError::MuxReply(ReplyCode::BadDevice)) => {
                self.pair_and_save(&mut lockdown).await?
            }
            Err(e) => return Err(e),
        };

        match lockdown.start_session(&record).await {
            Ok(()) => Ok(lockdown),
            Err(DeviceError::InvalidHostId) => {
                info!("device rejected host id; discarding pairing and retrying");
                *self.pair_record.lock().await = None;
                let mut mux = self.mux().await?;
                if let Err(e) = mux.delete_pair_record(&self.udid).await {
                    warn!("could not delete stale pair record: {e}");
                }
                let record = self.pair_and_save(&mut lockdown).await?;
                lockdown.start_session(&record).await?;
                Ok(lockdown)
            }
            Err(e) => Err(e),
        }
    }

    /// Device iOS version, e.g. `"13.4.1"`. Cached after the first query.
    pub async fn product_version(&self) -> Result<String, DeviceError> {
        {
            let cached = self.product_version.lock().await;
            if let Some(v) = cached.as_ref() {
                return Ok(v.clone());
            }
        }
        // Readable before any session is negotiated.
        let stream = self.connect_port(LOCKDOWN_PORT).await?;
        let mut lockdown = LockdownClient::new(stream);
        let version = lockdown
            .get_value(Some("ProductVersion"), None)
            .await?
            .as_string()
            .map(str::to_string)
            .ok_or(DeviceError::UnexpectedResponse)?;
        *self.product_version.lock().await = Some(version.clone());
        Ok(version)
    }

    pub async fn major_version(&self) -> Result<u32, DeviceError> {
        let version = self.product_version().await?;
        version
            .split('.')
            .next()
            .and_then(|x| x.parse().ok())
            .ok_or(DeviceError::UnexpectedResponse)
    }

    /// All device properties, optionally scoped to a domain such as
    /// `com.apple.disk_usage`.
    pub async fn device_info(
        &self,
        domain: Option<&str>,
    ) -> Result<plist::Dictionary, DeviceError> {
        let mut lockdown = self.lockdown_session().await?;
        let info = lockdown.get_all_values(domain).await?;
        lockdown.stop_session().await.ok();
        Ok(info)
    }

    /// Battery charge level, 0-100.
    pub async fn battery_level(&self) -> Result<u64, DeviceError> {
        let info = self.device_info(Some("com.apple.mobile.battery")).await?;
        info.get("BatteryCurrentCapacity")
            .and_then(|x| x.as_unsigned_integer())
            .ok_or(DeviceError::UnexpectedResponse)
    }

    pub async fn storage_info(&self) -> Result<StorageInfo, DeviceError> {
        let info = self.device_info(Some("com.apple.disk_usage")).await?;
        let field = |key: &str| {
            info.get(key)
                .and_then(|x| x.as_unsigned_integer())
                .ok_or(DeviceError::UnexpectedResponse)
        };
        let disk_size = field("TotalDiskCapacity")?;
        let size = field("TotalDataCapacity")?;
        let free = field("TotalDataAvailable")?;
        Ok(StorageInfo {
            disk_size,
            used: size.saturating_sub(free),
            free,
        })
    }

    pub async fn screen_info(&self) -> Result<ScreenInfo, DeviceError> {
        let info = self.device_info(Some("com.apple.mobile.iTunes")).await?;
        let number = |key: &str| {
            info.get(key)
                .and_then(|x| x.as_unsigned_integer())
                .ok_or(DeviceError::UnexpectedResponse)
        };
        Ok(ScreenInfo {
            width: number("ScreenWidth")?,
            height: number("ScreenHeight")?,
            scale: info
                .get("ScreenScaleFactor")
                .and_then(|x| x.as_real())
                .unwrap_or(1.0),
        })
    }

    #[async_recursion::async_recursion]
    async fn open_service(
        &self,
        name: &str,
        mount_retry: bool,
    ) -> Result<DeviceStream, DeviceError> {
        let mut lockdown = self.lockdown_session().await?;
        let endpoint = match lockdown.start_service(name).await {
            Ok(ep) => ep,
            Err(DeviceError::InvalidService) if mount_retry => {
                lockdown.stop_session().await.ok();
                info!("{name} unavailable; mounting the developer disk image");
                self.mount_developer_image().await?;
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let mut lockdown = self.lockdown_session().await?;
                let ep = lockdown.start_service(name).await?;
                lockdown.stop_session().await.ok();
                ep
            }
            Err(e) => return Err(e),
        };
        lockdown.stop_session().await.ok();

        debug!("service {name} on port {} (ssl={})", endpoint.port, endpoint.ssl);
        let mut stream = self.connect_port(endpoint.port).await?;
        if endpoint.ssl {
            // The session above guarantees a cached pair record by now.
            let record = self.pair_record().await?;
            let mode = if endpoint.dial_only {
                TlsMode::DialOnly
            } else {
                TlsMode::Full
            };
            stream.enable_tls(&record, mode).await?;
        }
        Ok(stream)
    }

    /// Starts a named service and returns its connected stream.
    ///
    /// When lockdown answers `InvalidService`, the developer disk image is
    /// mounted and the request retried exactly once.
    pub async fn start_service(&self, name: &str) -> Result<DeviceStream, DeviceError> {
        self.open_service(name, true).await
    }

    /// File conduit over the whole media partition.
    pub async fn afc(&self) -> Result<AfcClient, DeviceError> {
        let stream = self.start_service(AfcClient::SERVICE_NAME).await?;
        Ok(AfcClient::new(stream))
    }

    /// File conduit scoped to one application's sandbox.
    pub async fn app_sandbox(&self, bundle_id: &str) -> Result<AfcClient, DeviceError> {
        let stream = self.start_service(house_arrest::SERVICE_NAME).await?;
        house_arrest::vend_container(stream, bundle_id).await
    }

    pub async fn installation(&self) -> Result<InstallationProxyClient, DeviceError> {
        let stream = self
            .start_service(InstallationProxyClient::SERVICE_NAME)
            .await?;
        Ok(InstallationProxyClient::new(stream))
    }

    /// The mounter is opened without the mount-and-retry path, which would
    /// otherwise recurse through itself.
    pub async fn image_mounter(&self) -> Result<ImageMounterClient, DeviceError> {
        let stream = self
            .open_service(ImageMounterClient::SERVICE_NAME, false)
            .await?;
        Ok(ImageMounterClient::new(stream))
    }

    pub async fn screenshot_service(&self) -> Result<ScreenshotClient, DeviceError> {
        let stream = self.start_service(ScreenshotClient::SERVICE_NAME).await?;
        ScreenshotClient::exchange_versions(stream).await
    }

    pub async fn syslog(&self) -> Result<SyslogRelayClient, DeviceError> {
        let stream = self.start_service(SyslogRelayClient::SERVICE_NAME).await?;
        Ok(SyslogRelayClient::new(stream))
    }

    pub async fn crash_reports(&self) -> Result<CrashReportClient, DeviceError> {
        CrashReportClient::connect(self).await
    }

    /// DTX bus to the instruments remote server. iOS 14 moved the service
    /// behind a secure proxy name with a real TLS session; older versions
    /// use the dial-only name.
    pub async fn instruments(&self) -> Result<InstrumentsClient, DeviceError> {
        let name = if self.major_version().await? >= 14 {
            "com.apple.instruments.remoteserver.DVTSecureSocketProxy"
        } else {
            "com.apple.instruments.remoteserver"
        };
        let stream = self.start_service(name).await?;
        let conn = DtxConnection::connect(stream.into_socket()?).await?;
        Ok(InstrumentsClient::new(conn))
    }

    /// DTX bus to testmanagerd, with the same iOS 14 name split.
    pub async fn testmanagerd(&self) -> Result<DtxConnection, DeviceError> {
        let name = if self.major_version().await? >= 14 {
            "com.apple.testmanagerd.lockdown.secure"
        } else {
            "com.apple.testmanagerd.lockdown"
        };
        let stream = self.start_service(name).await?;
        DtxConnection::connect(stream.into_socket()?).await
    }

    /// Ensures the developer disk image is mounted, uploading it from a
    /// local cache when necessary.
    pub async fn mount_developer_image(&self) -> Result<(), DeviceError> {
        let mut mounter = self.image_mounter().await?;
        if !mounter.lookup("Developer").await?.is_empty() {
            debug!("developer image already mounted");
            return Ok(());
        }

        let version = self.product_version().await?;
        let short = version.split('.').take(2).collect::<Vec<_>>().join(".");
        let (image_path, signature_path) =
            developer_image_paths(&short).ok_or_else(|| {
                DeviceError::DeveloperImageNotFound(
                    developer_image_roots(&short)
                        .into_iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            })?;

        info!("mounting developer image from {image_path:?}");
        let image = tokio::fs::read(&image_path).await?;
        let signature = tokio::fs::read(&signature_path).await?;
        mounter.upload_image("Developer", &image, &signature).await?;
        mounter.mount_image("Developer", &signature).await?;
        info!("developer image mounted");
        Ok(())
    }
}

fn developer_image_roots(short_version: &str) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    roots.push(PathBuf::from(
        "/Applications/Xcode.app/Contents/Developer/Platforms/iPhoneOS.platform/DeviceSupport",
    ).join(short_version));
    if let Ok(dir) = crate::util::app_dir("device-support") {
        roots.push(dir.join(short_version));
    }
    roots
}

/// Finds `DeveloperDiskImage.dmg` + signature for an iOS `major.minor`.
fn developer_image_paths(short_version: &str) -> Option<(PathBuf, PathBuf)> {
    for root in developer_image_roots(short_version) {
        let image = root.join("DeveloperDiskImage.dmg");
        let signature = root.join("DeveloperDiskImage.dmg.signature");
        if image.is_file() && signature.is_file() {
            return Some((image, signature));
        }
    }
    None
}
