//! House arrest: file conduit access scoped to one application's sandbox.
//!
//! After `VendContainer` the service stops speaking property lists and
//! becomes a plain AFC endpoint rooted at the app container. The service's
//! acknowledgment plist is not read here: it arrives as the status prefix
//! the AFC reader already knows how to consume.

use crate::afc::AfcClient;
use crate::{DeviceError, DeviceStream};

pub const SERVICE_NAME: &str = "com.apple.mobile.house_arrest";

/// Requests the sandbox of `bundle_id` and hands the socket to AFC.
pub async fn vend_container(
    mut stream: DeviceStream,
    bundle_id: &str,
) -> Result<AfcClient, DeviceError> {
    let mut req = plist::Dictionary::new();
    req.insert("Command".into(), "VendContainer".into());
    req.insert("Identifier".into(), bundle_id.into());
    stream.send_plist(plist::Value::Dictionary(req)).await?;
    Ok(AfcClient::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn vend_reply_is_absorbed_as_afc_prefix() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let server_task = tokio::spawn(async move {
            // VendContainer request
            let mut len = [0u8; 4];
            server.read_exact(&mut len).await.unwrap();
            let mut body = vec![0; u32::from_be_bytes(len) as usize];
            server.read_exact(&mut body).await.unwrap();
            let req: plist::Dictionary = plist::from_bytes(&body).unwrap();
            assert_eq!(
                req.get("Command").and_then(|x| x.as_string()),
                Some("VendContainer")
            );
            assert_eq!(
                req.get("Identifier").and_then(|x| x.as_string()),
                Some("com.facebook.WebDriverAgentRunner.xctrunner")
            );

            // Status plist, then a real AFC status frame for the mkdir.
            let mut status = plist::Dictionary::new();
            status.insert("Status".into(), "Complete".into());
            let mut xml = Vec::new();
            plist::Value::Dictionary(status)
                .to_writer_xml(&mut xml)
                .unwrap();
            server
                .write_all(&(xml.len() as u32).to_be_bytes())
                .await
                .unwrap();
            server.write_all(&xml).await.unwrap();

            let mut header = [0u8; 40];
            server.read_exact(&mut header).await.unwrap();
            let this = u64::from_le_bytes(header[16..24].try_into().unwrap());
            let tag = u64::from_le_bytes(header[24..32].try_into().unwrap());
            let mut args = vec![0u8; (this - 40) as usize];
            server.read_exact(&mut args).await.unwrap();

            let reply = crate::afc::packet::AfcPacket::new(
                crate::afc::AfcOpcode::Status,
                tag,
                0u64.to_le_bytes().to_vec(),
                Vec::new(),
            );
            server.write_all(&reply.serialize()).await.unwrap();
        });

        let stream = DeviceStream::new(Box::new(client), crate::PROGRAM_NAME);
        let mut afc = vend_container(stream, "com.facebook.WebDriverAgentRunner.xctrunner")
            .await
            .unwrap();
        afc.mkdir("/tmp").await.unwrap();
        server_task.await.unwrap();
    }
}
