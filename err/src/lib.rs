#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("underlying block device init/eject failed")]
    HardwareFail,
    #[error("partition is not formatted as a FAT volume")]
    IncorrectFormat,
    #[error("file system is already mounted")]
    AlreadyInit,
    #[error("sector cache refused the request")]
    MemoryTableFail,
    #[error("device read failed")]
    ReadFail,
    #[error("device write failed")]
    WriteFail,
    #[error("master boot record signature is invalid")]
    InvalidDevice,
    #[error("entry not found")]
    NotFound,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid date or time")]
    InvalidTime,
    #[error("entry does not exist")]
    NotExist,
    #[error("unclassified failure")]
    Fail,
}

pub type Result<T> = core::result::Result<T, Error>;
