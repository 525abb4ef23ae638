//! Screenshot service, spoken over the DeviceLink message framing.
//!
//! The service opens with a version exchange, then answers
//! `ScreenShotRequest` messages with the raw image bytes. Decoding the
//! image is left to the caller.

use log::debug;

use crate::{DeviceError, DeviceStream};

#[derive(Debug)]
pub struct ScreenshotClient {
    stream: DeviceStream,
}

impl ScreenshotClient {
    pub const SERVICE_NAME: &'static str = "com.apple.mobile.screenshotr";

    /// Performs the DLMessage version exchange and returns a ready client.
    pub async fn exchange_versions(mut stream: DeviceStream) -> Result<Self, DeviceError> {
        let hello = stream.read_plist_value().await?;
        let hello = match hello.as_array() {
            Some(a) if a.first().and_then(|x| x.as_string())
                == Some("DLMessageVersionExchange") =>
            {
                a.to_vec()
            }
            _ => return Err(DeviceError::UnexpectedResponse),
        };
        let major = hello
            .get(1)
            .cloned()
            .ok_or(DeviceError::UnexpectedResponse)?;
        debug!("screenshot service version: {major:?}");

        stream
            .send_plist(plist::Value::Array(vec![
                "DLMessageVersionExchange".into(),
                "DLVersionsOk".into(),
                major,
            ]))
            .await?;

        let ready = stream.read_plist_value().await?;
        match ready.as_array().and_then(|a| a.first()).and_then(|x| x.as_string()) {
            Some("DLMessageDeviceReady") => Ok(Self { stream }),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Takes one screenshot; the result is the device's native image
    /// encoding (PNG on everything recent).
    pub async fn take(&mut self) -> Result<Vec<u8>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ScreenShotRequest".into());
        self.stream
            .send_plist(plist::Value::Array(vec![
                "DLMessageProcessMessage".into(),
                plist::Value::Dictionary(req),
            ]))
            .await?;

        let res = self.stream.read_plist_value().await?;
        let res = res.as_array().ok_or(DeviceError::UnexpectedResponse)?;
        if res.first().and_then(|x| x.as_string()) != Some("DLMessageProcessMessage") {
            return Err(DeviceError::UnexpectedResponse);
        }
        let body = res
            .get(1)
            .and_then(|x| x.as_dictionary())
            .ok_or(DeviceError::UnexpectedResponse)?;
        if body.get("MessageType").and_then(|x| x.as_string()) != Some("ScreenShotReply") {
            return Err(DeviceError::UnexpectedResponse);
        }
        match body.get("ScreenShotData") {
            Some(plist::Value::Data(d)) => Ok(d.clone()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn write_value(sock: &mut DuplexStream, value: plist::Value) {
        let mut xml = Vec::new();
        value.to_writer_xml(&mut xml).unwrap();
        sock.write_all(&(xml.len() as u32).to_be_bytes())
            .await
            .unwrap();
        sock.write_all(&xml).await.unwrap();
    }

    async fn read_value(sock: &mut DuplexStream) -> plist::Value {
        let mut len = [0u8; 4];
        sock.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        sock.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    #[tokio::test]
    async fn exchange_then_shot() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let png = vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3];
        let served = png.clone();

        let server_task = tokio::spawn(async move {
            write_value(
                &mut server,
                plist::Value::Array(vec![
                    "DLMessageVersionExchange".into(),
                    300u64.into(),
                    0u64.into(),
                ]),
            )
            .await;

            let ok = read_value(&mut server).await;
            let ok = ok.as_array().unwrap();
            assert_eq!(ok[1].as_string(), Some("DLVersionsOk"));
            assert_eq!(ok[2].as_unsigned_integer(), Some(300));

            write_value(
                &mut server,
                plist::Value::Array(vec!["DLMessageDeviceReady".into()]),
            )
            .await;

            let req = read_value(&mut server).await;
            let req = req.as_array().unwrap();
            assert_eq!(req[0].as_string(), Some("DLMessageProcessMessage"));

            let mut body = plist::Dictionary::new();
            body.insert("MessageType".into(), "ScreenShotReply".into());
            body.insert("ScreenShotData".into(), plist::Value::Data(served));
            write_value(
                &mut server,
                plist::Value::Array(vec![
                    "DLMessageProcessMessage".into(),
                    plist::Value::Dictionary(body),
                ]),
            )
            .await;
        });

        let stream = DeviceStream::new(Box::new(client), crate::PROGRAM_NAME);
        let mut shooter = ScreenshotClient::exchange_versions(stream).await.unwrap();
        let shot = shooter.take().await.unwrap();
        server_task.await.unwrap();
        assert_eq!(shot, png);
    }
}
