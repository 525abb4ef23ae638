// Status codes the device embeds in AFC status frames.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfcStatus {
    Success,
    UnknownError,
    OpHeaderInvalid,
    NoResources,
    ReadError,
    WriteError,
    UnknownPacketType,
    InvalidArg,
    ObjectNotFound,
    ObjectIsDir,
    PermDenied,
    ServiceNotConnected,
    OpTimeout,
    TooMuchData,
    EndOfData,
    OpNotSupported,
    ObjectExists,
    ObjectBusy,
    NoSpaceLeft,
    OpWouldBlock,
    IoError,
    OpInterrupted,
    OpInProgress,
    InternalError,
    MuxError,
    NoMem,
    NotEnoughData,
    DirNotEmpty,
    Other(u64),
}

impl From<u64> for AfcStatus {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::UnknownError,
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for AfcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::UnknownError => "unknown error",
            Self::OpHeaderInvalid => "operation header invalid",
            Self::NoResources => "no resources",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::UnknownPacketType => "unknown packet type",
            Self::InvalidArg => "invalid argument",
            Self::ObjectNotFound => "object not found",
            Self::ObjectIsDir => "object is a directory",
            Self::PermDenied => "permission denied",
            Self::ServiceNotConnected => "service not connected",
            Self::OpTimeout => "operation timed out",
            Self::TooMuchData => "too much data",
            Self::EndOfData => "end of data",
            Self::OpNotSupported => "operation not supported",
            Self::ObjectExists => "object exists",
            Self::ObjectBusy => "object busy",
            Self::NoSpaceLeft => "no space left",
            Self::OpWouldBlock => "operation would block",
            Self::IoError => "io error",
            Self::OpInterrupted => "operation interrupted",
            Self::OpInProgress => "operation in progress",
            Self::InternalError => "internal error",
            Self::MuxError => "mux error",
            Self::NoMem => "out of memory",
            Self::NotEnoughData => "not enough data",
            Self::DirNotEmpty => "directory not empty",
            Self::Other(code) => return write!(f, "status {code}"),
        };
        f.write_str(text)
    }
}
