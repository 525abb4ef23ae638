//! XCUITest bring-up: the three-connection dance that testmanagerd and the
//! instruments server expect, in the order they expect it.
//!
//! Two DTX connections go to testmanagerd (a control session and the
//! session that will execute the test plan) and one to the instruments
//! server (to launch the runner process). The driver then waits until
//! either testmanagerd connection drops or the caller signals stop, and
//! kills the runner on the way out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Notify;

use crate::device::Device;
use crate::dtx::{AuxValue, DtxConnection};
use crate::instruments::InstrumentsClient;
use crate::nskeyed::{NsValue, XcTestConfiguration};
use crate::DeviceError;

/// Protocol version Xcode 11+ negotiates.
pub const IDE_PROTOCOL_VERSION: i64 = 29;

const IDE_DAEMON_CHANNEL: &str =
    "dtxproxy:XCTestManager_IDEInterface:XCTestManager_DaemonConnectionInterface";

const BUNDLE_READY_SELECTOR: &str = "_XCT_testBundleReadyWithProtocolVersion:minimumVersion:";
const LOG_MESSAGE_SELECTOR: &str = "_XCT_logDebugMessage:";
const RUNNER_READY_MARKER: &str = "Received test runner ready reply with error: (null";

/// Strips the conventional `-Runner` suffix off the runner executable.
pub fn target_name(executable: &str) -> &str {
    executable.strip_suffix("-Runner").unwrap_or(executable)
}

/// Environment the runner is launched with.
pub fn runner_environment(
    app_path: &str,
    container: &str,
    config_path: &str,
    major_version: u32,
) -> HashMap<String, NsValue> {
    let mut env = HashMap::new();
    env.insert(
        "CA_ASSERT_MAIN_THREAD_TRANSACTIONS".to_string(),
        NsValue::from("0"),
    );
    env.insert("CA_DEBUG_TRANSACTIONS".to_string(), NsValue::from("0"));
    env.insert(
        "DYLD_FRAMEWORK_PATH".to_string(),
        NsValue::String(format!("{app_path}/Frameworks:")),
    );
    env.insert(
        "DYLD_LIBRARY_PATH".to_string(),
        NsValue::String(format!("{app_path}/Frameworks")),
    );
    env.insert("NSUnbufferedIO".to_string(), NsValue::from("YES"));
    env.insert(
        "SQLITE_ENABLE_THREAD_ASSERTIONS".to_string(),
        NsValue::from("1"),
    );
    env.insert(
        "XCTestConfigurationFilePath".to_string(),
        NsValue::from(config_path),
    );
    env.insert(
        "XCODE_DBG_XPC_EXCLUSIONS".to_string(),
        NsValue::from("com.apple.dt.xctestSymbolicator"),
    );
    env.insert(
        "LLVM_PROFILE_FILE".to_string(),
        NsValue::String(format!("{container}/tmp/%p.profraw")),
    );
    if major_version >= 11 {
        env.insert(
            "DYLD_INSERT_LIBRARIES".to_string(),
            NsValue::from("/Developer/usr/lib/libMainThreadChecker.dylib"),
        );
        env.insert("OS_ACTIVITY_DT_MODE".to_string(), NsValue::from("YES"));
    }
    env
}

fn launch_options(major_version: u32) -> HashMap<String, NsValue> {
    let mut options = HashMap::new();
    options.insert("StartSuspendedKey".to_string(), NsValue::Bool(false));
    if major_version >= 12 {
        options.insert("ActivateSuspended".to_string(), NsValue::Bool(true));
    }
    options
}

fn check_reply(reply: &crate::dtx::DtxMessage, what: &str) -> Result<(), DeviceError> {
    if let Some(NsValue::Error { code, domain, .. }) = reply.object() {
        return Err(DeviceError::ServiceFailure(format!(
            "{what} failed: {domain} ({code})"
        )));
    }
    Ok(())
}

/// Drives one UI-test runner session.
#[derive(Debug)]
pub struct XcTestDriver<'a> {
    device: &'a Device,
    bundle_id: String,
}

impl<'a> XcTestDriver<'a> {
    pub fn new(device: &'a Device, bundle_id: impl Into<String>) -> Self {
        Self {
            device,
            bundle_id: bundle_id.into(),
        }
    }

    /// Brings the runner up and blocks until a testmanagerd connection
    /// drops or `stop` fires. The runner process is killed on exit.
    pub async fn run(&self, stop: Arc<Notify>) -> Result<(), DeviceError> {
        let major = self.device.major_version().await?;
        let session_id = uuid::Uuid::new_v4();

        // Control connection.
        let x1 = Arc::new(self.device.testmanagerd().await?);
        let x1_channel = x1.make_channel(IDE_DAEMON_CHANNEL).await?;
        if major >= 11 {
            let reply = x1
                .call(
                    x1_channel,
                    "_IDE_initiateControlSessionWithProtocolVersion:",
                    &[AuxValue::archived(IDE_PROTOCOL_VERSION)],
                )
                .await?;
            check_reply(&reply, "control session")?;
        }

        // Execution connection, with the runner-ready triggers armed
        // before anything can fire them.
        let x2 = Arc::new(self.device.testmanagerd().await?);
        let x2_channel = x2.make_channel(IDE_DAEMON_CHANNEL).await?;
        let mut bundle_ready = x2.subscribe(BUNDLE_READY_SELECTOR);
        let mut log_messages = x2.subscribe(LOG_MESSAGE_SELECTOR);

        let started = Arc::new(AtomicBool::new(false));
        {
            let x2 = x2.clone();
            let started = started.clone();
            tokio::spawn(async move {
                let start = |x2: &DtxConnection, started: &AtomicBool| {
                    if started.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    info!("runner ready; starting test plan");
                    if let Err(e) = x2.notify(
                        u32::MAX,
                        "_IDE_startExecutingTestPlanWithProtocolVersion:",
                        &[AuxValue::archived(IDE_PROTOCOL_VERSION)],
                    ) {
                        warn!("could not start test plan: {e}");
                    }
                };
                loop {
                    tokio::select! {
                        msg = bundle_ready.next() => match msg {
                            Some(_) => start(&x2, &started),
                            None => break,
                        },
                        msg = log_messages.next() => match msg {
                            Some(msg) => {
                                let text = msg
                                    .arguments()
                                    .iter()
                                    .filter_map(|a| a.as_object().and_then(|o| o.as_str()))
                                    .collect::<String>();
                                debug!("runner: {}", text.trim_end());
                                if text.contains(RUNNER_READY_MARKER) {
                                    start(&x2, &started);
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        // Push the test configuration into the runner sandbox.
        let mut installation = self.device.installation().await?;
        let app_info = installation
            .lookup_one(&self.bundle_id)
            .await?
            .ok_or_else(|| {
                DeviceError::ServiceFailure(format!("{} is not installed", self.bundle_id))
            })?;
        let app_path = app_info
            .get("Path")
            .and_then(|x| x.as_string())
            .ok_or(DeviceError::UnexpectedResponse)?
            .to_string();
        let container = app_info
            .get("Container")
            .and_then(|x| x.as_string())
            .ok_or(DeviceError::UnexpectedResponse)?
            .to_string();
        let executable = app_info
            .get("CFBundleExecutable")
            .and_then(|x| x.as_string())
            .ok_or(DeviceError::UnexpectedResponse)?
            .to_string();
        let target = target_name(&executable);

        let mut config = XcTestConfiguration::new(
            &format!("file://{app_path}/PlugIns/{target}.xctest"),
            session_id,
        );
        config.set("productModuleName", NsValue::from(target));
        let config_bytes = crate::nskeyed::encode(&NsValue::TestConfig(config))?;

        let config_name = format!(
            "{}-{}.xctestconfiguration",
            target,
            session_id.to_string().to_uppercase()
        );
        let mut sandbox = self.device.app_sandbox(&self.bundle_id).await?;
        for stale in sandbox.list_dir("/tmp").await? {
            if stale.ends_with(".xctestconfiguration") {
                debug!("removing stale /tmp/{stale}");
                sandbox.remove(&format!("/tmp/{stale}")).await.ok();
            }
        }
        sandbox
            .push(&format!("/tmp/{config_name}"), &config_bytes)
            .await?;

        // Launch the runner through the instruments server.
        let instruments = self.device.instruments().await?;
        let env = runner_environment(
            &app_path,
            &container,
            &format!("{container}/tmp/{config_name}"),
            major,
        );
        let args = vec![
            NsValue::from("-NSTreatUnknownArgumentsAsOpen"),
            NsValue::from("NO"),
            NsValue::from("-ApplePersistenceIgnoreState"),
            NsValue::from("YES"),
        ];
        let pid = instruments
            .launch_app(&app_path, &self.bundle_id, env, args, launch_options(major))
            .await?;
        info!("runner {} launched as pid {pid}", self.bundle_id);
        instruments.start_observing_pid(pid).await?;
        spawn_output_logger(&instruments);

        // Hand the session to the daemon.
        let reply = x2
            .call(
                x2_channel,
                "_IDE_initiateSessionWithIdentifier:forClient:atPath:protocolVersion:",
                &[
                    AuxValue::archived(session_id),
                    AuxValue::Object(NsValue::String(format!(
                        "{session_id}-6722-000247F15966B083"
                    ))),
                    AuxValue::archived(
                        "/Applications/Xcode.app/Contents/Developer/usr/bin/xcodebuild",
                    ),
                    AuxValue::archived(IDE_PROTOCOL_VERSION),
                ],
            )
            .await?;
        check_reply(&reply, "session initiation")?;

        // Authorize the test process; the call shape moved across iOS
        // releases.
        let reply = if major >= 12 {
            x1.call(
                x1_channel,
                "_IDE_authorizeTestSessionWithProcessID:",
                &[AuxValue::archived(pid as i64)],
            )
            .await?
        } else if major >= 10 {
            x1.call(
                x1_channel,
                "_IDE_initiateControlSessionForTestProcessID:protocolVersion:",
                &[
                    AuxValue::archived(pid as i64),
                    AuxValue::archived(IDE_PROTOCOL_VERSION),
                ],
            )
            .await?
        } else {
            x1.call(
                x1_channel,
                "_IDE_initiateControlSessionForTestProcessID:",
                &[AuxValue::archived(pid as i64)],
            )
            .await?
        };
        check_reply(&reply, "test session authorization")?;

        // Run until a connection drops or the caller asks out.
        tokio::select! {
            _ = x1.wait_closed() => warn!("control connection closed"),
            _ = x2.wait_closed() => warn!("execution connection closed"),
            _ = stop.notified() => info!("stop requested"),
        }

        if let Err(e) = instruments.app_kill(pid).await {
            debug!("could not kill runner {pid}: {e}");
        }
        instruments.close();
        x1.close();
        x2.close();
        Ok(())
    }
}

/// Mirrors runner output notifications into the log.
fn spawn_output_logger(instruments: &InstrumentsClient) {
    let mut output = instruments
        .connection()
        .subscribe("outputReceived:fromProcess:atTime:");
    tokio::spawn(async move {
        while let Some(msg) = output.next().await {
            if let Some(line) = msg
                .arguments()
                .first()
                .and_then(|a| a.as_object())
                .and_then(|o| o.as_str())
            {
                info!("runner output: {}", line.trim_end());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_name_strips_runner_suffix() {
        assert_eq!(target_name("WebDriverAgentRunner-Runner"), "WebDriverAgentRunner");
        assert_eq!(target_name("PlainExecutable"), "PlainExecutable");
    }

    #[test]
    fn environment_matches_launch_contract() {
        let env = runner_environment(
            "/private/var/containers/Bundle/App/X/WDA.app",
            "/private/var/mobile/Containers/Data/Application/Y",
            "/private/var/mobile/Containers/Data/Application/Y/tmp/cfg.xctestconfiguration",
            13,
        );
        assert_eq!(
            env.get("DYLD_FRAMEWORK_PATH"),
            Some(&NsValue::from(
                "/private/var/containers/Bundle/App/X/WDA.app/Frameworks:"
            ))
        );
        assert_eq!(env.get("NSUnbufferedIO"), Some(&NsValue::from("YES")));
        assert_eq!(
            env.get("XCTestConfigurationFilePath"),
            Some(&NsValue::from(
                "/private/var/mobile/Containers/Data/Application/Y/tmp/cfg.xctestconfiguration"
            ))
        );
        assert_eq!(
            env.get("LLVM_PROFILE_FILE"),
            Some(&NsValue::from(
                "/private/var/mobile/Containers/Data/Application/Y/tmp/%p.profraw"
            ))
        );
        // iOS 11+ additions present on 13.
        assert_eq!(
            env.get("DYLD_INSERT_LIBRARIES"),
            Some(&NsValue::from(
                "/Developer/usr/lib/libMainThreadChecker.dylib"
            ))
        );
        assert_eq!(env.get("OS_ACTIVITY_DT_MODE"), Some(&NsValue::from("YES")));

        // And absent on 10.
        let old = runner_environment("/a", "/c", "/c/tmp/x", 10);
        assert!(!old.contains_key("DYLD_INSERT_LIBRARIES"));
        assert!(!old.contains_key("OS_ACTIVITY_DT_MODE"));
    }

    #[test]
    fn launch_options_follow_version_split() {
        let old = launch_options(11);
        assert_eq!(old.get("StartSuspendedKey"), Some(&NsValue::Bool(false)));
        assert!(!old.contains_key("ActivateSuspended"));

        let new = launch_options(12);
        assert_eq!(new.get("ActivateSuspended"), Some(&NsValue::Bool(true)));
    }
}
