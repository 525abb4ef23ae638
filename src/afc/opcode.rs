// Operation numbers for the file conduit protocol.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    ReadFile = 0x04,
    WriteFile = 0x05,
    WritePart = 0x06,
    Truncate = 0x07,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    WriteFileAtomic = 0x0c,
    FileOpen = 0x0d,
    FileOpenResult = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellResult = 0x13,
    FileClose = 0x14,
    FileSetSize = 0x15,
    GetConnectionInfo = 0x16,
    SetConnectionOptions = 0x17,
    RenamePath = 0x18,
    SetFsBlockSize = 0x19,
    SetSocketBlockSize = 0x1A,
    FileLock = 0x1B,
    MakeLink = 0x1C,
    SetFileTime = 0x1E,
    GetFileHashRange = 0x1F,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, u64> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x04 => Self::ReadFile,
            0x05 => Self::WriteFile,
            0x06 => Self::WritePart,
            0x07 => Self::Truncate,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x0c => Self::WriteFileAtomic,
            0x0d => Self::FileOpen,
            0x0e => Self::FileOpenResult,
            0x0f => Self::Read,
            0x10 => Self::Write,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellResult,
            0x14 => Self::FileClose,
            0x15 => Self::FileSetSize,
            0x16 => Self::GetConnectionInfo,
            0x17 => Self::SetConnectionOptions,
            0x18 => Self::RenamePath,
            0x19 => Self::SetFsBlockSize,
            0x1A => Self::SetSocketBlockSize,
            0x1B => Self::FileLock,
            0x1C => Self::MakeLink,
            0x1E => Self::SetFileTime,
            0x1F => Self::GetFileHashRange,
            other => return Err(other),
        })
    }
}

/// Open modes for `FileOpen`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum FileMode {
    /// `r`
    ReadOnly = 0x01,
    /// `r+`
    ReadWrite = 0x02,
    /// `w`
    WriteOnly = 0x03,
    /// `w+`
    WriteTruncate = 0x04,
    /// `a`
    Append = 0x05,
    /// `a+`
    ReadAppend = 0x06,
}

/// Link kinds for `MakeLink`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LinkKind {
    Hard = 1,
    Symbolic = 2,
}

/// Lock operations for `FileLock`; values carry the non-blocking bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LockOp {
    Shared = 1 | 4,
    Exclusive = 2 | 4,
    Unlock = 8 | 4,
}
