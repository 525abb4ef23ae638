//! Crash report harvesting.
//!
//! The mover service flushes pending reports into the copy area (it
//! answers with a literal `ping`); the copy service is then a plain AFC
//! tree that is pulled and, on request, deleted report by report.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::afc::AfcClient;
use crate::device::Device;
use crate::DeviceError;

pub const MOVER_SERVICE: &str = "com.apple.crashreportmover";
pub const COPY_SERVICE: &str = "com.apple.crashreportcopymobile";

#[derive(Debug)]
pub struct CrashReportClient {
    afc: AfcClient,
}

impl CrashReportClient {
    pub async fn connect(device: &Device) -> Result<Self, DeviceError> {
        let mut mover = device.start_service(MOVER_SERVICE).await?;
        let ping = mover.read_raw(4).await?;
        if ping != b"ping" {
            warn!("crash mover answered {ping:?} instead of ping");
        }

        let stream = device.start_service(COPY_SERVICE).await?;
        Ok(Self {
            afc: AfcClient::new(stream),
        })
    }

    pub fn afc(&mut self) -> &mut AfcClient {
        &mut self.afc
    }

    /// Device paths of every crash report currently on the device.
    pub async fn list(&mut self) -> Result<Vec<String>, DeviceError> {
        let mut reports = Vec::new();
        for entry in self.afc.walk("/", false).await? {
            for file in entry.files {
                reports.push(format!(
                    "{}/{}",
                    entry.path.trim_end_matches('/'),
                    file
                ));
            }
        }
        Ok(reports)
    }

    /// Pulls every report into `dest`, optionally deleting the originals.
    pub async fn pull_all(
        &mut self,
        dest: &Path,
        remove: bool,
    ) -> Result<Vec<PathBuf>, DeviceError> {
        tokio::fs::create_dir_all(dest).await?;
        let mut pulled = Vec::new();
        for report in self.list().await? {
            let data = match self.afc.pull(&report).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("skipping {report}: {e}");
                    continue;
                }
            };
            let local = dest.join(report.trim_start_matches('/'));
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local, data).await?;
            if remove {
                self.afc.remove(&report).await?;
            }
            pulled.push(local);
        }
        info!("pulled {} crash reports", pulled.len());
        Ok(pulled)
    }
}
