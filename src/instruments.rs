//! Facade over the instruments remote server.
//!
//! Every operation is a thin wrapper over a DTX call on a named channel.
//! Streams subscribe to the notification hook and filter by the channel
//! the device mirrors samples onto (`2^32 − code`); several of them have
//! no device-side stop, so cancellation is closing the connection.

use std::collections::HashMap;

use log::warn;

use crate::dtx::{reply_channel, AuxValue, DtxConnection, DtxMessage, DtxSubscription, NOTIFICATION_KEY};
use crate::nskeyed::NsValue;
use crate::DeviceError;

pub const PROCESS_CONTROL: &str = "com.apple.instruments.server.services.processcontrol";
pub const DEVICE_INFO: &str = "com.apple.instruments.server.services.deviceinfo";
pub const APP_LISTING: &str = "com.apple.instruments.server.services.device.applictionListing";
pub const GRAPHICS_OPENGL: &str = "com.apple.instruments.server.services.graphics.opengl";
pub const SYSMONTAP: &str = "com.apple.instruments.server.services.sysmontap";
pub const NETWORKING: &str = "com.apple.instruments.server.services.networking";
pub const MOBILE_NOTIFICATIONS: &str = "com.apple.instruments.server.services.mobilenotifications";
pub const ENERGY: &str = "com.apple.xcode.debug-gauge-data-providers.Energy";

const LAUNCH_SELECTOR: &str =
    "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:";

/// Samples delivered by a running stream, filtered to its channel.
#[derive(Debug)]
pub struct SampleStream {
    sub: DtxSubscription,
    channel: u32,
}

impl SampleStream {
    /// Next sample; `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<DtxMessage> {
        while let Some(msg) = self.sub.next().await {
            if msg.channel == self.channel {
                return Some(msg);
            }
        }
        None
    }
}

/// Interface counters from the global network stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSample {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Interprets a networking-channel message; interface totals arrive as a
/// type-2 record with the counters in the argument vector.
pub fn parse_network_sample(msg: &DtxMessage) -> Option<NetworkSample> {
    match &msg.payload {
        crate::dtx::DtxPayload::Invocation { selector, arguments }
            if selector.as_i64() == Some(2) && arguments.len() >= 4 =>
        {
            Some(NetworkSample {
                rx_packets: arguments[0].as_u64()?,
                rx_bytes: arguments[1].as_u64()?,
                tx_packets: arguments[2].as_u64()?,
                tx_bytes: arguments[3].as_u64()?,
            })
        }
        _ => None,
    }
}

/// The sysmontap configuration used for CPU/memory sampling.
pub fn sysmon_config(sample_interval_ns: i64) -> NsValue {
    let proc_attrs = [
        "memVirtualSize",
        "cpuUsage",
        "ctxSwitch",
        "intWakeups",
        "physFootprint",
        "memResidentSize",
        "memAnon",
        "pid",
    ];
    let sys_attrs = [
        "vmExtPageCount",
        "vmFreeCount",
        "vmPurgeableCount",
        "vmSpeculativeCount",
        "physMemSize",
    ];

    let mut config = HashMap::new();
    config.insert("bm".to_string(), NsValue::Int(0));
    config.insert("cpuUsage".to_string(), NsValue::Bool(true));
    config.insert(
        "procAttrs".to_string(),
        NsValue::Array(proc_attrs.iter().map(|a| NsValue::from(*a)).collect()),
    );
    config.insert(
        "sysAttrs".to_string(),
        NsValue::Array(sys_attrs.iter().map(|a| NsValue::from(*a)).collect()),
    );
    config.insert("sampleInterval".to_string(), NsValue::Int(sample_interval_ns));
    config.insert("ur".to_string(), NsValue::Int(1000));
    NsValue::Dictionary(config)
}

/// Client over one instruments DTX connection.
#[derive(Debug)]
pub struct InstrumentsClient {
    conn: DtxConnection,
}

impl InstrumentsClient {
    pub fn new(conn: DtxConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &DtxConnection {
        &self.conn
    }

    /// Closes the underlying connection; this is also how every stream is
    /// stopped.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Launches an app and returns its pid.
    pub async fn launch_app(
        &self,
        device_path: &str,
        bundle_id: &str,
        environment: HashMap<String, NsValue>,
        arguments: Vec<NsValue>,
        options: HashMap<String, NsValue>,
    ) -> Result<u64, DeviceError> {
        let channel = self.conn.make_channel(PROCESS_CONTROL).await?;
        let args = [
            AuxValue::archived(device_path),
            AuxValue::archived(bundle_id),
            AuxValue::Object(NsValue::Dictionary(environment)),
            AuxValue::Object(NsValue::Array(arguments)),
            AuxValue::Object(NsValue::Dictionary(options)),
        ];
        let reply = self.conn.call(channel, LAUNCH_SELECTOR, &args).await?;
        match reply.object() {
            Some(NsValue::Int(pid)) if *pid >= 0 => Ok(*pid as u64),
            other => {
                warn!("launch of {bundle_id} failed: {other:?}");
                Err(DeviceError::ServiceFailure(format!(
                    "launch failed: {other:?}"
                )))
            }
        }
    }

    /// Launches with the plain defaults (not suspended, optionally killing
    /// a running instance).
    pub async fn app_launch(&self, bundle_id: &str, kill_existing: bool) -> Result<u64, DeviceError> {
        let mut options = HashMap::new();
        options.insert("StartSuspendedKey".to_string(), NsValue::Int(0));
        options.insert("KillExisting".to_string(), NsValue::Bool(kill_existing));
        self.launch_app("", bundle_id, HashMap::new(), Vec::new(), options)
            .await
    }

    /// Kills a pid. Fire and forget; the device sends no confirmation.
    pub async fn app_kill(&self, pid: u64) -> Result<(), DeviceError> {
        let channel = self.conn.make_channel(PROCESS_CONTROL).await?;
        self.conn
            .notify(channel, "killPid:", &[AuxValue::archived(pid as i64)])
    }

    /// Subscribes the instruments server to a pid's lifecycle; its output
    /// then arrives as `outputReceived:fromProcess:atTime:` notifications.
    pub async fn start_observing_pid(&self, pid: u64) -> Result<(), DeviceError> {
        let channel = self.conn.make_channel(PROCESS_CONTROL).await?;
        self.conn
            .call(channel, "startObservingPid:", &[AuxValue::archived(pid as i64)])
            .await?;
        Ok(())
    }

    pub async fn running_processes(&self) -> Result<Vec<NsValue>, DeviceError> {
        let channel = self.conn.make_channel(DEVICE_INFO).await?;
        let reply = self.conn.call(channel, "runningProcesses", &[]).await?;
        match reply.object() {
            Some(NsValue::Array(a)) => Ok(a.clone()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    pub async fn system_info(&self) -> Result<NsValue, DeviceError> {
        let channel = self.conn.make_channel(DEVICE_INFO).await?;
        let reply = self.conn.call(channel, "systemInformation", &[]).await?;
        reply
            .object()
            .cloned()
            .ok_or(DeviceError::UnexpectedResponse)
    }

    pub async fn installed_apps(&self) -> Result<Vec<NsValue>, DeviceError> {
        let channel = self.conn.make_channel(APP_LISTING).await?;
        let args = [
            AuxValue::Object(NsValue::Dictionary(HashMap::new())),
            AuxValue::archived(""),
        ];
        let reply = self
            .conn
            .call(channel, "installedApplicationsMatching:registerUpdateToken:", &args)
            .await?;
        match reply.object() {
            Some(NsValue::Array(a)) => Ok(a.clone()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Resolves a bundle id to a running pid by joining the process list
    /// against the installed-app table.
    pub async fn pid_for_bundle(&self, bundle_id: &str) -> Result<Option<u64>, DeviceError> {
        let apps = self.installed_apps().await?;
        let exe_path = apps.iter().find_map(|app| {
            let app = app.as_dictionary()?;
            if app.get("CFBundleIdentifier")?.as_str()? != bundle_id {
                return None;
            }
            let path = app.get("Path")?.as_str()?;
            let exe = app.get("CFBundleExecutable")?.as_str()?;
            Some(format!("{path}/{exe}"))
        });
        let exe_path = match exe_path {
            Some(p) => p,
            None => return Ok(None),
        };
        let stripped = exe_path.strip_prefix("/private").unwrap_or(&exe_path);

        for process in self.running_processes().await? {
            let Some(process) = process.as_dictionary() else {
                continue;
            };
            let real = process
                .get("realAppName")
                .and_then(|x| x.as_str())
                .unwrap_or("");
            let real = real.strip_prefix("/private").unwrap_or(real);
            if real == stripped {
                return Ok(process.get("pid").and_then(|x| x.as_i64()).map(|p| p as u64));
            }
        }
        Ok(None)
    }

    /// FPS/GPU counters from the graphics driver, roughly once a second.
    pub async fn fps_stream(&self) -> Result<SampleStream, DeviceError> {
        let channel = self.conn.make_channel(GRAPHICS_OPENGL).await?;
        let sub = self.conn.subscribe(NOTIFICATION_KEY);
        self.conn.notify(
            channel,
            "startSamplingAtTimeInterval:",
            &[AuxValue::archived(0i64)],
        )?;
        Ok(SampleStream {
            sub,
            channel: reply_channel(channel),
        })
    }

    /// CPU/memory sampling via sysmontap.
    pub async fn sysmon_stream(&self, config: Option<NsValue>) -> Result<SampleStream, DeviceError> {
        let channel = self.conn.make_channel(SYSMONTAP).await?;
        let config = config.unwrap_or_else(|| sysmon_config(1_000_000_000));
        self.conn
            .call(channel, "setConfig:", &[AuxValue::Object(config)])
            .await?;
        let sub = self.conn.subscribe(NOTIFICATION_KEY);
        self.conn.call(channel, "start", &[]).await?;
        Ok(SampleStream {
            sub,
            channel: reply_channel(channel),
        })
    }

    /// Whole-device network counters.
    pub async fn network_stream(&self) -> Result<SampleStream, DeviceError> {
        let channel = self.conn.make_channel(NETWORKING).await?;
        let sub = self.conn.subscribe(NOTIFICATION_KEY);
        self.conn.call(channel, "startMonitoring", &[]).await?;
        Ok(SampleStream {
            sub,
            channel: reply_channel(channel),
        })
    }

    /// Application state transitions (foreground, suspended, ...).
    pub async fn app_state_stream(&self) -> Result<SampleStream, DeviceError> {
        let channel = self.conn.make_channel(MOBILE_NOTIFICATIONS).await?;
        let sub = self.conn.subscribe(NOTIFICATION_KEY);
        self.conn.notify(
            channel,
            "setApplicationStateNotificationsEnabled:",
            &[AuxValue::Object(NsValue::Bool(true))],
        )?;
        Ok(SampleStream {
            sub,
            channel: reply_channel(channel),
        })
    }

    pub async fn start_energy_sampling(&self, pid: u64) -> Result<(), DeviceError> {
        let channel = self.conn.make_channel(ENERGY).await?;
        self.conn
            .call(
                channel,
                "startSamplingForPIDs:",
                &[AuxValue::Object(NsValue::Set(vec![NsValue::Int(pid as i64)]))],
            )
            .await?;
        Ok(())
    }

    /// One energy sample for a pid; the reply is keyed by pid.
    pub async fn sample_energy(&self, pid: u64) -> Result<NsValue, DeviceError> {
        let channel = self.conn.make_channel(ENERGY).await?;
        let args = [
            AuxValue::Object(NsValue::Dictionary(HashMap::new())),
            AuxValue::Object(NsValue::Set(vec![NsValue::Int(pid as i64)])),
        ];
        let reply = self
            .conn
            .call(channel, "sampleAttributes:forPIDs:", &args)
            .await?;
        reply
            .object()
            .cloned()
            .ok_or(DeviceError::UnexpectedResponse)
    }

    pub async fn stop_energy_sampling(&self, pid: u64) -> Result<(), DeviceError> {
        let channel = self.conn.make_channel(ENERGY).await?;
        self.conn
            .call(
                channel,
                "stopSamplingForPIDs:",
                &[AuxValue::Object(NsValue::Set(vec![NsValue::Int(pid as i64)]))],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtx::message::{
        build_frame, DtxMessageHeader, DtxPayload, DtxPayloadHeader,
    };
    use crate::nskeyed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_invocation(sock: &mut DuplexStream) -> (DtxMessageHeader, String, Vec<AuxValue>) {
        loop {
            let mut head = [0u8; 32];
            sock.read_exact(&mut head).await.unwrap();
            let header = DtxMessageHeader::parse(&head).unwrap();
            let mut body = vec![0u8; header.payload_length as usize];
            sock.read_exact(&mut body).await.unwrap();
            let (_, payload) = DtxPayload::parse(&body).unwrap();
            match payload {
                DtxPayload::Invocation { selector, arguments } => {
                    let selector = selector.as_str().unwrap().to_string();
                    if selector == "_notifyOfPublishedCapabilities:" {
                        continue;
                    }
                    return (header, selector, arguments);
                }
                other => panic!("expected invocation, got {other:?}"),
            }
        }
    }

    async fn write_null_reply(sock: &mut DuplexStream, to: &DtxMessageHeader) {
        let header = DtxPayloadHeader {
            flags: 0x05,
            aux_length: 0,
            total_length: 0,
        };
        let frame = build_frame(to.message_id, 1, to.channel, false, &header.serialize());
        sock.write_all(&frame).await.unwrap();
    }

    async fn write_object_reply(sock: &mut DuplexStream, to: &DtxMessageHeader, value: &NsValue) {
        let object = nskeyed::encode(value).unwrap();
        let header = DtxPayloadHeader {
            flags: 0x03,
            aux_length: 0,
            total_length: object.len() as u64,
        };
        let mut payload = header.serialize().to_vec();
        payload.extend_from_slice(&object);
        let frame = build_frame(to.message_id, 1, to.channel, false, &payload);
        sock.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn launch_allocates_channel_and_returns_pid() {
        let (client, mut server) = tokio::io::duplex(1 << 18);
        let server_task = tokio::spawn(async move {
            let (request, selector, arguments) = read_invocation(&mut server).await;
            assert_eq!(selector, "_requestChannelWithCode:identifier:");
            assert_eq!(arguments[0], AuxValue::U32(1));
            assert_eq!(
                arguments[1].as_object().and_then(|o| o.as_str()),
                Some(PROCESS_CONTROL)
            );
            write_null_reply(&mut server, &request).await;

            let (request, selector, arguments) = read_invocation(&mut server).await;
            assert_eq!(selector, LAUNCH_SELECTOR);
            assert_eq!(request.channel, 1);
            assert_eq!(
                arguments[1].as_object().and_then(|o| o.as_str()),
                Some("com.example.app")
            );
            write_object_reply(&mut server, &request, &NsValue::Int(1234)).await;
        });

        let conn = DtxConnection::connect(Box::new(client)).await.unwrap();
        let instruments = InstrumentsClient::new(conn);
        let pid = instruments.app_launch("com.example.app", true).await.unwrap();
        server_task.await.unwrap();
        assert_eq!(pid, 1234);
    }

    #[tokio::test]
    async fn fps_stream_filters_on_mirrored_channel_and_ends_on_close() {
        let (client, mut server) = tokio::io::duplex(1 << 18);
        let server_task = tokio::spawn(async move {
            let (request, selector, _) = read_invocation(&mut server).await;
            assert_eq!(selector, "_requestChannelWithCode:identifier:");
            write_null_reply(&mut server, &request).await;

            let (_, selector, _) = read_invocation(&mut server).await;
            assert_eq!(selector, "startSamplingAtTimeInterval:");

            // One sample on the mirrored channel, one unrelated frame.
            let mut sample = HashMap::new();
            sample.insert(
                "CoreAnimationFramesPerSecond".to_string(),
                NsValue::Int(59),
            );
            let object = nskeyed::encode(&NsValue::Dictionary(sample)).unwrap();
            let header = DtxPayloadHeader {
                flags: 0x03,
                aux_length: 0,
                total_length: object.len() as u64,
            };
            let mut payload = header.serialize().to_vec();
            payload.extend_from_slice(&object);

            let unrelated = build_frame(90, 0, 55, false, &payload);
            server.write_all(&unrelated).await.unwrap();
            let mirrored = build_frame(91, 0, reply_channel(1), false, &payload);
            server.write_all(&mirrored).await.unwrap();
        });

        let conn = DtxConnection::connect(Box::new(client)).await.unwrap();
        let instruments = InstrumentsClient::new(conn);
        let mut stream = instruments.fps_stream().await.unwrap();

        let sample = stream.next().await.expect("one sample");
        assert_eq!(sample.channel, reply_channel(1));
        let fps = sample
            .object()
            .and_then(|o| o.as_dictionary())
            .and_then(|d| d.get("CoreAnimationFramesPerSecond"))
            .and_then(|v| v.as_i64());
        assert_eq!(fps, Some(59));

        server_task.await.unwrap();
        instruments.close();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn network_samples_parse_type_two_records() {
        let msg = DtxMessage {
            channel: reply_channel(2),
            message_id: 5,
            conversation_index: 0,
            expects_reply: false,
            flags: 2,
            payload: crate::dtx::DtxPayload::Invocation {
                selector: NsValue::Int(2),
                arguments: vec![
                    AuxValue::U64(10),
                    AuxValue::U64(2048),
                    AuxValue::U64(7),
                    AuxValue::U64(1024),
                ],
            },
        };
        assert_eq!(
            parse_network_sample(&msg),
            Some(NetworkSample {
                rx_packets: 10,
                rx_bytes: 2048,
                tx_packets: 7,
                tx_bytes: 1024,
            })
        );

        let other = DtxMessage {
            payload: crate::dtx::DtxPayload::Empty,
            ..msg
        };
        assert_eq!(parse_network_sample(&other), None);
    }
}
