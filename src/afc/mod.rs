//! Apple File Conduit client: directory and file operations over a mux
//! pipe.
//!
//! Frames are binary, not property lists. One quirk is handled on the
//! first read: some firmware prepends a length-prefixed status property
//! list before the first real frame, so the reader sniffs the first four
//! bytes and consumes the status when the magic does not match.

use std::collections::HashMap;

use async_recursion::async_recursion;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::{DeviceError, DeviceStream};

pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

pub use errors::AfcStatus;
pub use file::AfcFile;
pub use opcode::{AfcOpcode, FileMode, LinkKind, LockOp};
use packet::{AfcPacket, AfcPacketHeader, AFC_MAGIC};

/// Chunk size for uploads.
const WRITE_CHUNK: usize = 1 << 15;
/// Chunk size for downloads.
const READ_CHUNK: usize = 1 << 16;

/// Result of `stat`: the attribute pairs the device reports, with
/// timestamps in nanoseconds converted up front.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub st_ifmt: String,
    pub st_size: u64,
    pub st_blocks: u64,
    pub st_nlink: u64,
    pub st_mtime: DateTime<Utc>,
    pub st_birthtime: DateTime<Utc>,
    pub link_target: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.st_ifmt == "S_IFDIR"
    }

    pub fn is_link(&self) -> bool {
        self.st_ifmt == "S_IFLNK"
    }
}

/// One directory visited by [`AfcClient::walk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: String,
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// Client for the file conduit service.
#[derive(Debug)]
pub struct AfcClient {
    stream: DeviceStream,
    tag: u64,
    sniffed_prefix: bool,
}

fn pad_path(path: &str) -> Vec<u8> {
    let mut buf = path.as_bytes().to_vec();
    buf.push(0);
    buf
}

fn join_path(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

impl AfcClient {
    pub const SERVICE_NAME: &'static str = "com.apple.afc";

    pub fn new(stream: DeviceStream) -> Self {
        Self {
            stream,
            tag: 0,
            sniffed_prefix: false,
        }
    }

    fn next_tag(&mut self) -> u64 {
        let tag = self.tag;
        self.tag += 1;
        tag
    }

    async fn send_packet(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<(), DeviceError> {
        let tag = self.next_tag();
        let packet = AfcPacket::new(operation, tag, header_payload, payload);
        self.stream.send_raw(&packet.serialize()).await
    }

    async fn read_packet(&mut self) -> Result<AfcPacket, DeviceError> {
        let mut first = self.stream.read_raw(4).await?;
        if !self.sniffed_prefix {
            self.sniffed_prefix = true;
            if first != AFC_MAGIC.to_le_bytes()[..4] {
                // Unsolicited status plist before the first frame: a
                // big-endian length then XML.
                let len = u32::from_be_bytes(first[..4].try_into().unwrap());
                let body = self.stream.read_raw(len as usize).await?;
                let status: plist::Dictionary = plist::from_bytes(&body)?;
                debug!("consumed status prefix: {status:?}");
                if let Some(e) = status.get("Error") {
                    let e: String = plist::from_value(e)?;
                    return Err(DeviceError::ServiceFailure(e));
                }
                first = self.stream.read_raw(4).await?;
            }
        }

        let rest = self.stream.read_raw(AfcPacketHeader::LEN as usize - 4).await?;
        let mut header_bytes = first;
        header_bytes.extend_from_slice(&rest);
        let header = AfcPacketHeader::parse(&header_bytes)?;

        let header_payload = self
            .stream
            .read_raw((header.this_len - AfcPacketHeader::LEN) as usize)
            .await?;
        let payload = self
            .stream
            .read_raw((header.entire_len - header.this_len) as usize)
            .await?;
        Ok(AfcPacket {
            header,
            header_payload,
            payload,
        })
    }

    /// Sends one request and reads its reply, converting status frames
    /// with a non-zero code into errors.
    pub(crate) async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, DeviceError> {
        self.send_packet(operation, header_payload, payload).await?;
        let reply = self.read_packet().await?;
        if reply.header.operation == AfcOpcode::Status {
            let code = std::io::Cursor::new(&reply.header_payload)
                .read_u64::<LE>()
                .map_err(|_| DeviceError::UnexpectedResponse)?;
            let status = AfcStatus::from(code);
            if status != AfcStatus::Success {
                return Err(DeviceError::Afc(status));
            }
        }
        Ok(reply)
    }

    /// Lists a directory, without the `.`/`..` entries.
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        let reply = self
            .request(AfcOpcode::ReadDir, path.as_bytes().to_vec(), Vec::new())
            .await?;
        Ok(reply
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .filter(|s| s != "." && s != "..")
            .collect())
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<(), DeviceError> {
        self.request(AfcOpcode::MakeDir, path.as_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }

    /// Removes a file or an empty directory.
    pub async fn remove(&mut self, path: &str) -> Result<(), DeviceError> {
        self.request(AfcOpcode::RemovePath, pad_path(path), Vec::new())
            .await?;
        Ok(())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), DeviceError> {
        let mut args = pad_path(from);
        args.extend_from_slice(&pad_path(to));
        self.request(AfcOpcode::RenamePath, args, Vec::new()).await?;
        Ok(())
    }

    pub async fn link(
        &mut self,
        kind: LinkKind,
        target: &str,
        link_name: &str,
    ) -> Result<(), DeviceError> {
        let mut args = Vec::new();
        args.write_u64::<LE>(kind as u64).unwrap();
        args.extend_from_slice(&pad_path(target));
        args.extend_from_slice(&pad_path(link_name));
        self.request(AfcOpcode::MakeLink, args, Vec::new()).await?;
        Ok(())
    }

    /// Sets a file's modification time, in nanoseconds since the epoch.
    pub async fn set_mtime(&mut self, path: &str, mtime_ns: u64) -> Result<(), DeviceError> {
        let mut args = Vec::new();
        args.write_u64::<LE>(mtime_ns).unwrap();
        args.extend_from_slice(&pad_path(path));
        self.request(AfcOpcode::SetFileTime, args, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn stat(&mut self, path: &str) -> Result<FileInfo, DeviceError> {
        let reply = self
            .request(AfcOpcode::GetFileInfo, path.as_bytes().to_vec(), Vec::new())
            .await?;

        let mut kvs: HashMap<String, String> = HashMap::new();
        let parts: Vec<&[u8]> = reply
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .collect();
        for pair in parts.chunks_exact(2) {
            kvs.insert(
                String::from_utf8_lossy(pair[0]).into_owned(),
                String::from_utf8_lossy(pair[1]).into_owned(),
            );
        }

        fn number(kvs: &mut HashMap<String, String>, key: &'static str) -> Result<u64, DeviceError> {
            kvs.remove(key)
                .and_then(|x| x.parse().ok())
                .ok_or(DeviceError::AfcMissingAttribute(key))
        }
        fn timestamp(
            kvs: &mut HashMap<String, String>,
            key: &'static str,
        ) -> Result<DateTime<Utc>, DeviceError> {
            let ns = kvs
                .remove(key)
                .and_then(|x| x.parse::<i64>().ok())
                .ok_or(DeviceError::AfcMissingAttribute(key))?;
            Ok(DateTime::from_timestamp_nanos(ns))
        }

        Ok(FileInfo {
            st_size: number(&mut kvs, "st_size")?,
            st_blocks: number(&mut kvs, "st_blocks")?,
            st_nlink: number(&mut kvs, "st_nlink")?,
            st_mtime: timestamp(&mut kvs, "st_mtime")?,
            st_birthtime: timestamp(&mut kvs, "st_birthtime")?,
            st_ifmt: kvs
                .remove("st_ifmt")
                .ok_or(DeviceError::AfcMissingAttribute("st_ifmt"))?,
            link_target: kvs.remove("LinkTarget"),
        })
    }

    pub async fn exists(&mut self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    pub async fn open<'a>(
        &'a mut self,
        path: &str,
        mode: FileMode,
    ) -> Result<AfcFile<'a>, DeviceError> {
        let mut args = Vec::new();
        args.write_u64::<LE>(mode as u64).unwrap();
        args.extend_from_slice(&pad_path(path));
        let reply = self.request(AfcOpcode::FileOpen, args, Vec::new()).await?;
        let fd = std::io::Cursor::new(&reply.header_payload)
            .read_u64::<LE>()
            .map_err(|_| DeviceError::UnexpectedResponse)?;
        if fd == 0 {
            return Err(DeviceError::UnexpectedResponse);
        }
        Ok(AfcFile { client: self, fd })
    }

    /// Downloads a whole file, following a symlink once.
    pub async fn pull(&mut self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let info = self.stat(path).await?;
        if info.is_dir() {
            return Err(DeviceError::Afc(AfcStatus::ObjectIsDir));
        }
        let path = match (info.is_link(), info.link_target) {
            (true, Some(target)) => target,
            _ => path.to_string(),
        };

        let mut file = self.open(&path, FileMode::ReadOnly).await?;
        let mut buf = Vec::new();
        let result = loop {
            match file.read(READ_CHUNK).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        let close = file.close().await;
        result?;
        close?;
        Ok(buf)
    }

    /// Uploads a buffer, streaming in 32 KiB chunks.
    pub async fn push(&mut self, path: &str, data: &[u8]) -> Result<(), DeviceError> {
        let mut file = self.open(path, FileMode::WriteTruncate).await?;
        let mut result = Ok(());
        for chunk in data.chunks(WRITE_CHUNK) {
            if let Err(e) = file.write(chunk).await {
                result = Err(e);
                break;
            }
        }
        let close = file.close().await;
        result?;
        close?;
        Ok(())
    }

    /// Recursive traversal. Symlinked directories are only descended into
    /// with `follow_links`.
    pub async fn walk(
        &mut self,
        top: &str,
        follow_links: bool,
    ) -> Result<Vec<WalkEntry>, DeviceError> {
        let mut out = Vec::new();
        self.walk_into(top, follow_links, &mut out).await?;
        Ok(out)
    }

    #[async_recursion]
    async fn walk_into(
        &mut self,
        top: &str,
        follow_links: bool,
        out: &mut Vec<WalkEntry>,
    ) -> Result<(), DeviceError> {
        if !self.stat(top).await?.is_dir() {
            return Ok(());
        }
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for name in self.list_dir(top).await? {
            if name.is_empty() {
                continue;
            }
            let path = join_path(top, &name);
            let info = match self.stat(&path).await {
                Ok(i) => i,
                Err(e) => {
                    warn!("skipping {path}: {e}");
                    continue;
                }
            };
            if info.is_dir() {
                if !info.is_link() || follow_links {
                    dirs.push(name);
                }
            } else {
                files.push(name);
            }
        }
        out.push(WalkEntry {
            path: top.to_string(),
            dirs: dirs.clone(),
            files,
        });
        for dir in dirs {
            let path = join_path(top, &dir);
            self.walk_into(&path, follow_links, out).await?;
        }
        Ok(())
    }

    /// Removes a tree, depth first.
    #[async_recursion]
    pub async fn remove_tree(&mut self, path: &str) -> Result<(), DeviceError> {
        if self.stat(path).await?.is_dir() {
            for name in self.list_dir(path).await? {
                self.remove_tree(&join_path(path, &name)).await?;
            }
        }
        self.remove(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct FakeConduit {
        files: HashMap<String, Vec<u8>>,
        fds: HashMap<u64, (String, usize)>,
        next_fd: u64,
    }

    async fn read_request(sock: &mut DuplexStream) -> (u64, u64, Vec<u8>, Vec<u8>) {
        let mut header = [0u8; 40];
        sock.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..8], b"CFA6LPAA");
        let entire = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let this = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let tag = u64::from_le_bytes(header[24..32].try_into().unwrap());
        let op = u64::from_le_bytes(header[32..40].try_into().unwrap());
        let mut args = vec![0u8; (this - 40) as usize];
        sock.read_exact(&mut args).await.unwrap();
        let mut payload = vec![0u8; (entire - this) as usize];
        sock.read_exact(&mut payload).await.unwrap();
        (op, tag, args, payload)
    }

    async fn write_reply(
        sock: &mut DuplexStream,
        op: AfcOpcode,
        tag: u64,
        args: Vec<u8>,
        payload: Vec<u8>,
    ) {
        let packet = AfcPacket::new(op, tag, args, payload);
        sock.write_all(&packet.serialize()).await.unwrap();
    }

    async fn write_status(sock: &mut DuplexStream, tag: u64, code: u64) {
        write_reply(
            sock,
            AfcOpcode::Status,
            tag,
            code.to_le_bytes().to_vec(),
            Vec::new(),
        )
        .await;
    }

    fn cstr(data: &[u8]) -> String {
        String::from_utf8_lossy(data.split(|b| *b == 0).next().unwrap()).into_owned()
    }

    fn stat_payload(size: usize) -> Vec<u8> {
        let fields = [
            ("st_size", size.to_string()),
            ("st_blocks", "0".to_string()),
            ("st_nlink", "1".to_string()),
            ("st_ifmt", "S_IFREG".to_string()),
            ("st_mtime", "1591588092361862409".to_string()),
            ("st_birthtime", "1591588092361695702".to_string()),
        ];
        let mut out = Vec::new();
        for (k, v) in fields {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out
    }

    impl FakeConduit {
        fn new() -> Self {
            Self {
                files: HashMap::new(),
                fds: HashMap::new(),
                next_fd: 1,
            }
        }

        async fn serve(mut self, mut sock: DuplexStream, with_prefix: bool) {
            if with_prefix {
                let mut status = plist::Dictionary::new();
                status.insert("Status".into(), "Complete".into());
                let mut xml = Vec::new();
                plist::Value::Dictionary(status)
                    .to_writer_xml(&mut xml)
                    .unwrap();
                sock.write_all(&(xml.len() as u32).to_be_bytes())
                    .await
                    .unwrap();
                sock.write_all(&xml).await.unwrap();
            }

            loop {
                let (op, tag, args, payload) = read_request(&mut sock).await;
                match AfcOpcode::try_from(op).unwrap() {
                    AfcOpcode::MakeDir => write_status(&mut sock, tag, 0).await,
                    AfcOpcode::GetFileInfo => {
                        let path = String::from_utf8_lossy(&args).into_owned();
                        match self.files.get(&path) {
                            Some(data) => {
                                write_reply(
                                    &mut sock,
                                    AfcOpcode::Data,
                                    tag,
                                    Vec::new(),
                                    stat_payload(data.len()),
                                )
                                .await
                            }
                            None => write_status(&mut sock, tag, 8).await, // not found
                        }
                    }
                    AfcOpcode::FileOpen => {
                        let path = cstr(&args[8..]);
                        self.files.entry(path.clone()).or_default();
                        let fd = self.next_fd;
                        self.next_fd += 1;
                        self.fds.insert(fd, (path, 0));
                        write_reply(
                            &mut sock,
                            AfcOpcode::FileOpenResult,
                            tag,
                            fd.to_le_bytes().to_vec(),
                            Vec::new(),
                        )
                        .await;
                    }
                    AfcOpcode::Write => {
                        let fd = u64::from_le_bytes(args[..8].try_into().unwrap());
                        let (path, _) = self.fds.get(&fd).unwrap().clone();
                        self.files.get_mut(&path).unwrap().extend_from_slice(&payload);
                        write_status(&mut sock, tag, 0).await;
                    }
                    AfcOpcode::Read => {
                        let fd = u64::from_le_bytes(args[..8].try_into().unwrap());
                        let max = u64::from_le_bytes(args[8..16].try_into().unwrap()) as usize;
                        let (path, pos) = self.fds.get(&fd).unwrap().clone();
                        let data = &self.files[&path];
                        let end = (pos + max).min(data.len());
                        let chunk = data[pos..end].to_vec();
                        self.fds.insert(fd, (path, end));
                        write_reply(&mut sock, AfcOpcode::Data, tag, Vec::new(), chunk).await;
                    }
                    AfcOpcode::FileClose => {
                        let fd = u64::from_le_bytes(args[..8].try_into().unwrap());
                        self.fds.remove(&fd);
                        write_status(&mut sock, tag, 0).await;
                    }
                    other => panic!("fake conduit got {other:?}"),
                }
            }
        }
    }

    fn client_over(sock: DuplexStream) -> AfcClient {
        AfcClient::new(DeviceStream::new(Box::new(sock), crate::PROGRAM_NAME))
    }

    #[tokio::test]
    async fn status_prefix_is_consumed_before_first_frame() {
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(FakeConduit::new().serve(server, true));

        let mut afc = client_over(client);
        afc.mkdir("PublicStaging").await.unwrap();
    }

    #[tokio::test]
    async fn error_status_prefix_raises() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let mut status = plist::Dictionary::new();
            status.insert("Status".into(), "Error".into());
            status.insert("Error".into(), "PermissionDenied".into());
            let mut xml = Vec::new();
            plist::Value::Dictionary(status)
                .to_writer_xml(&mut xml)
                .unwrap();
            server
                .write_all(&(xml.len() as u32).to_be_bytes())
                .await
                .unwrap();
            server.write_all(&xml).await.unwrap();
            // Keep the socket open while the client parses the prefix.
            let _ = read_request(&mut server).await;
        });

        let mut afc = client_over(client);
        match afc.mkdir("x").await.unwrap_err() {
            DeviceError::ServiceFailure(e) => assert_eq!(e, "PermissionDenied"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_then_pull_is_byte_identical() {
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(FakeConduit::new().serve(server, false));

        let mut afc = client_over(client);
        // Big enough to need several write chunks.
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        afc.push("tmp/blob.bin", &data).await.unwrap();
        let back = afc.pull("tmp/blob.bin").await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn missing_file_maps_to_object_not_found() {
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(FakeConduit::new().serve(server, false));

        let mut afc = client_over(client);
        match afc.stat("no/such/file").await.unwrap_err() {
            DeviceError::Afc(AfcStatus::ObjectNotFound) => {}
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!afc.exists("no/such/file").await);
    }

    #[tokio::test]
    async fn stat_parses_nanosecond_timestamps() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let (_, tag, _, _) = read_request(&mut server).await;
            write_reply(&mut server, AfcOpcode::Data, tag, Vec::new(), stat_payload(96)).await;
        });

        let mut afc = client_over(client);
        let info = afc.stat("Documents").await.unwrap();
        assert_eq!(info.st_size, 96);
        assert_eq!(info.st_ifmt, "S_IFREG");
        assert_eq!(info.st_mtime.timestamp(), 1591588092);
        assert_eq!(info.st_mtime.timestamp_subsec_nanos(), 361862409);
        assert!(!info.is_dir());
    }
}
