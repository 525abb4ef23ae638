//! Installation proxy: install, uninstall and enumerate applications.
//!
//! Install and Uninstall stream progress dictionaries until `Complete` or
//! an `Error` key; Browse pages results in `CurrentList` batches.

use log::{error, info};

use crate::{DeviceError, DeviceStream};

#[derive(Debug)]
pub struct InstallationProxyClient {
    pub stream: DeviceStream,
}

impl InstallationProxyClient {
    pub const SERVICE_NAME: &'static str = "com.apple.mobile.installation_proxy";

    pub fn new(stream: DeviceStream) -> Self {
        Self { stream }
    }

    /// Installs a package already present on the AFC staging area.
    pub async fn install(
        &mut self,
        bundle_id: &str,
        package_path: &str,
    ) -> Result<(), DeviceError> {
        let mut options = plist::Dictionary::new();
        options.insert("CFBundleIdentifier".into(), bundle_id.into());

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Install".into());
        req.insert("ClientOptions".into(), plist::Value::Dictionary(options));
        req.insert("PackagePath".into(), package_path.into());
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        self.drain_progress("Install").await
    }

    pub async fn uninstall(&mut self, bundle_id: &str) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Uninstall".into());
        req.insert("ApplicationIdentifier".into(), bundle_id.into());
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        self.drain_progress("Uninstall").await
    }

    /// Reads progress dictionaries until the device reports `Complete`.
    async fn drain_progress(&mut self, what: &str) -> Result<(), DeviceError> {
        // Steps like VerifyingApplication can dwarf the ordinary
        // request/reply window.
        self.stream.set_reply_timeout(None);
        let result = loop {
            let progress = match self.stream.read_plist().await {
                Ok(p) => p,
                Err(DeviceError::ServiceFailure(e)) => {
                    error!("{what} failed: {e}");
                    break Err(DeviceError::InstallationFailed(e));
                }
                Err(e) => break Err(e),
            };
            match progress.get("Status").and_then(|x| x.as_string()) {
                Some("Complete") => break Ok(()),
                Some(status) => {
                    let percent = progress
                        .get("PercentComplete")
                        .and_then(|x| x.as_unsigned_integer())
                        .unwrap_or(0);
                    info!("{what}: {status} ({percent}%)");
                }
                None => {}
            }
        };
        self.stream
            .set_reply_timeout(Some(crate::PLIST_REPLY_TIMEOUT));
        result
    }

    /// Looks up installed apps by bundle id; the result is keyed by id.
    pub async fn lookup(
        &mut self,
        bundle_ids: &[&str],
    ) -> Result<plist::Dictionary, DeviceError> {
        let mut options = plist::Dictionary::new();
        options.insert(
            "BundleIDs".into(),
            plist::Value::Array(bundle_ids.iter().map(|id| (*id).into()).collect()),
        );

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Lookup".into());
        req.insert("ClientOptions".into(), plist::Value::Dictionary(options));
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        let mut res = self.stream.read_plist().await?;
        match res.remove("LookupResult") {
            Some(plist::Value::Dictionary(d)) => Ok(d),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Convenience for a single bundle id.
    pub async fn lookup_one(
        &mut self,
        bundle_id: &str,
    ) -> Result<Option<plist::Dictionary>, DeviceError> {
        let mut res = self.lookup(&[bundle_id]).await?;
        match res.remove(bundle_id) {
            Some(plist::Value::Dictionary(d)) => Ok(Some(d)),
            _ => Ok(None),
        }
    }

    /// Enumerates installed applications.
    ///
    /// `app_type` filters by `User`/`System`; `attrs` trims the returned
    /// dictionaries to the named keys.
    pub async fn browse(
        &mut self,
        app_type: Option<&str>,
        attrs: Option<&[&str]>,
    ) -> Result<Vec<plist::Dictionary>, DeviceError> {
        let mut options = plist::Dictionary::new();
        if let Some(app_type) = app_type {
            options.insert("ApplicationType".into(), app_type.into());
        }
        if let Some(attrs) = attrs {
            options.insert(
                "ReturnAttributes".into(),
                plist::Value::Array(attrs.iter().map(|a| (*a).into()).collect()),
            );
        }

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Browse".into());
        req.insert("ClientOptions".into(), plist::Value::Dictionary(options));
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        let mut apps = Vec::new();
        loop {
            let mut res = self.stream.read_plist().await?;
            let status = res
                .get("Status")
                .and_then(|x| x.as_string())
                .unwrap_or_default()
                .to_string();
            if let Some(plist::Value::Array(list)) = res.remove("CurrentList") {
                for entry in list {
                    if let plist::Value::Dictionary(d) = entry {
                        apps.push(d);
                    }
                }
            }
            if status == "Complete" {
                break;
            }
        }
        Ok(apps)
    }
}
