//! Syslog relay: an unframed stream of NUL-terminated log lines.
//!
//! There is no stop request; the stream ends when the caller drops the
//! client, which closes the socket.

use crate::{DeviceError, DeviceStream};

#[derive(Debug)]
pub struct SyslogRelayClient {
    stream: DeviceStream,
    buffer: Vec<u8>,
}

impl SyslogRelayClient {
    pub const SERVICE_NAME: &'static str = "com.apple.syslog_relay";

    pub fn new(stream: DeviceStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Next log line, or `None` once the device closes the stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, DeviceError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == 0) {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop(); // the NUL
                let text = String::from_utf8_lossy(&line)
                    .trim_end_matches(|c| c == '\r' || c == '\n')
                    .to_string();
                return Ok(Some(text));
            }
            match self.stream.read_some(4096).await {
                Ok(chunk) if chunk.is_empty() => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let line = std::mem::take(&mut self.buffer);
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                // Closure ends the stream rather than raising.
                Err(DeviceError::Socket(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn splits_on_nul_and_ends_on_eof() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            server.write_all(b"May 11 kernel[0]: first\n\0May 11 spring").await.unwrap();
            server.write_all(b"board[59]: second\n\0").await.unwrap();
        });

        let stream = DeviceStream::new(Box::new(client), crate::PROGRAM_NAME);
        let mut syslog = SyslogRelayClient::new(stream);
        assert_eq!(
            syslog.next_line().await.unwrap().as_deref(),
            Some("May 11 kernel[0]: first")
        );
        assert_eq!(
            syslog.next_line().await.unwrap().as_deref(),
            Some("May 11 springboard[59]: second")
        );
        assert_eq!(syslog.next_line().await.unwrap(), None);
    }
}
