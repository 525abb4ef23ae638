// Remote file handles. A handle borrows the client, so file IO is serial
// per connection, matching the conduit itself. Close explicitly on every
// path; the device leaks descriptors otherwise.

use std::io::SeekFrom;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::DeviceError;

use super::opcode::{AfcOpcode, LockOp};
use super::AfcClient;

/// An open file on the device.
#[derive(Debug)]
pub struct AfcFile<'a> {
    pub(super) client: &'a mut AfcClient,
    pub(super) fd: u64,
}

impl AfcFile<'_> {
    pub fn fd(&self) -> u64 {
        self.fd
    }

    /// Reads up to `max` bytes; an empty result means end of file.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, DeviceError> {
        let mut args = Vec::with_capacity(16);
        args.write_u64::<LE>(self.fd).unwrap();
        args.write_u64::<LE>(max as u64).unwrap();
        let packet = self.client.request(AfcOpcode::Read, args, Vec::new()).await?;
        Ok(packet.payload)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let mut args = Vec::with_capacity(8);
        args.write_u64::<LE>(self.fd).unwrap();
        self.client
            .request(AfcOpcode::Write, args, data.to_vec())
            .await?;
        Ok(())
    }

    pub async fn seek(&mut self, position: SeekFrom) -> Result<(), DeviceError> {
        let (whence, offset) = match position {
            SeekFrom::Start(o) => (0u64, o as i64),
            SeekFrom::Current(o) => (1u64, o),
            SeekFrom::End(o) => (2u64, o),
        };
        let mut args = Vec::with_capacity(24);
        args.write_u64::<LE>(self.fd).unwrap();
        args.write_u64::<LE>(whence).unwrap();
        args.write_i64::<LE>(offset).unwrap();
        self.client
            .request(AfcOpcode::FileSeek, args, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn tell(&mut self) -> Result<u64, DeviceError> {
        let mut args = Vec::with_capacity(8);
        args.write_u64::<LE>(self.fd).unwrap();
        let packet = self
            .client
            .request(AfcOpcode::FileTell, args, Vec::new())
            .await?;
        let mut data = std::io::Cursor::new(packet.header_payload);
        data.read_u64::<LE>()
            .map_err(|_| DeviceError::UnexpectedResponse)
    }

    pub async fn truncate(&mut self, size: u64) -> Result<(), DeviceError> {
        let mut args = Vec::with_capacity(16);
        args.write_u64::<LE>(self.fd).unwrap();
        args.write_u64::<LE>(size).unwrap();
        self.client
            .request(AfcOpcode::FileSetSize, args, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn lock(&mut self, op: LockOp) -> Result<(), DeviceError> {
        let mut args = Vec::with_capacity(16);
        args.write_u64::<LE>(self.fd).unwrap();
        args.write_u64::<LE>(op as u64).unwrap();
        self.client
            .request(AfcOpcode::FileLock, args, Vec::new())
            .await?;
        Ok(())
    }

    /// Releases the device-side descriptor.
    pub async fn close(self) -> Result<(), DeviceError> {
        let mut args = Vec::with_capacity(8);
        args.write_u64::<LE>(self.fd).unwrap();
        self.client
            .request(AfcOpcode::FileClose, args, Vec::new())
            .await?;
        Ok(())
    }
}
