//! Developer disk image mounter.
//!
//! Three-step protocol: announce the image with `ReceiveBytes`, stream its
//! raw bytes over the same socket, then `MountImage` pointing at the
//! staging path. A device that reports the image as already mounted is
//! treated as success.

use log::{debug, info};

use crate::{DeviceError, DeviceStream};

const STAGING_PATH: &str = "/private/var/mobile/Media/PublicStaging/staging.dimag";

#[derive(Debug)]
pub struct ImageMounterClient {
    pub stream: DeviceStream,
}

impl ImageMounterClient {
    pub const SERVICE_NAME: &'static str = "com.apple.mobile.mobile_image_mounter";

    pub fn new(stream: DeviceStream) -> Self {
        Self { stream }
    }

    /// Lists signatures of mounted images of the given type.
    ///
    /// Succeeds only while the device is unlocked; the locked case comes
    /// back as [`DeviceError::DeviceLocked`].
    pub async fn lookup(&mut self, image_type: &str) -> Result<Vec<Vec<u8>>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "LookupImage".into());
        req.insert("ImageType".into(), image_type.into());
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        let mut res = self.stream.read_plist().await?;
        match res.remove("ImageSignature") {
            Some(plist::Value::Array(signatures)) => Ok(signatures
                .into_iter()
                .filter_map(|s| match s {
                    plist::Value::Data(d) => Some(d),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Streams the image to the staging area.
    pub async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
    ) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ReceiveBytes".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSize".into(), (image.len() as u64).into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.stream.read_plist().await?;
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("ReceiveBytesAck") => {}
            other => {
                debug!("ReceiveBytes answered {other:?}");
                return Err(DeviceError::UnexpectedResponse);
            }
        }

        info!("pushing {} image bytes", image.len());
        self.stream.send_raw(image).await?;

        // The device checks the signature after the last byte; no bound on
        // how long that takes.
        self.stream.set_reply_timeout(None);
        let res = self.stream.read_plist().await;
        self.stream
            .set_reply_timeout(Some(crate::PLIST_REPLY_TIMEOUT));
        match res?.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            other => {
                debug!("image push answered {other:?}");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }

    /// Mounts the previously uploaded image.
    pub async fn mount_image(
        &mut self,
        image_type: &str,
        signature: &[u8],
    ) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "MountImage".into());
        req.insert("ImagePath".into(), STAGING_PATH.into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        self.stream.send_plist(plist::Value::Dictionary(req)).await?;

        // Read uninterpreted: an "already mounted" complaint counts as
        // mounted.
        let res = self.stream.read_plist_value().await?;
        let res: plist::Dictionary = plist::from_value(&res)?;
        if let Some(detail) = res.get("DetailedError").and_then(|x| x.as_string()) {
            if detail.contains("is already mounted at /Developer") {
                info!("image was already mounted");
                return Ok(());
            }
        }
        if let Some(e) = res.get("Error") {
            let e: String = plist::from_value(e)?;
            return Err(DeviceError::from_device_error(&e)
                .unwrap_or(DeviceError::ServiceFailure(e)));
        }
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_frame(sock: &mut DuplexStream) -> plist::Dictionary {
        let mut len = [0u8; 4];
        sock.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        sock.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    async fn write_frame(sock: &mut DuplexStream, body: plist::Dictionary) {
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
    async fn upload_streams_bytes_between_acks() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let image = vec![0xD5u8; 4096];
        let expected = image.clone();

        let server_task = tokio::spawn(async move {
            let req = read_frame(&mut server).await;
            assert_eq!(
                req.get("Command").and_then(|x| x.as_string()),
                Some("ReceiveBytes")
            );
            assert_eq!(
                req.get("ImageSize").and_then(|x| x.as_unsigned_integer()),
                Some(4096)
            );
            let mut ack = plist::Dictionary::new();
            ack.insert("Status".into(), "ReceiveBytesAck".into());
            write_frame(&mut server, ack).await;

            let mut got = vec![0u8; expected.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);

            let mut done = plist::Dictionary::new();
            done.insert("Status".into(), "Complete".into());
            write_frame(&mut server, done).await;
        });

        let stream = DeviceStream::new(Box::new(client), crate::PROGRAM_NAME);
        let mut mounter = ImageMounterClient::new(stream);
        mounter
            .upload_image("Developer", &image, b"signature")
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn already_mounted_counts_as_success() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let server_task = tokio::spawn(async move {
            let req = read_frame(&mut server).await;
            assert_eq!(
                req.get("Command").and_then(|x| x.as_string()),
                Some("MountImage")
            );
            let mut res = plist::Dictionary::new();
            res.insert("Error".into(), "InternalError".into());
            res.insert(
                "DetailedError".into(),
                "There is already an image of that type; it is already mounted at /Developer"
                    .into(),
            );
            write_frame(&mut server, res).await;
        });

        let stream = DeviceStream::new(Box::new(client), crate::PROGRAM_NAME);
        let mut mounter = ImageMounterClient::new(stream);
        mounter.mount_image("Developer", b"signature").await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn locked_device_surfaces_as_device_locked() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let server_task = tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            let mut res = plist::Dictionary::new();
            res.insert("Error".into(), "DeviceLocked".into());
            write_frame(&mut server, res).await;
        });

        let stream = DeviceStream::new(Box::new(client), crate::PROGRAM_NAME);
        let mut mounter = ImageMounterClient::new(stream);
        match mounter.lookup("Developer").await.unwrap_err() {
            DeviceError::DeviceLocked => {}
            other => panic!("unexpected error {other:?}"),
        }
        server_task.await.unwrap();
    }
}
