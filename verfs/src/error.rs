use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerFSError {
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no free space left in bitmap")]
    NoSpace,
    #[error("found no entry with that name")]
    DoesNotExist,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("name longer than {} bytes", crate::dir::DIR_NAME_MAX)]
    NameTooLong,
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(String),
}

pub type Result<T> = std::result::Result<T, VerFSError>;

impl VerFSError {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        VerFSError::InvalidArgument(msg.into())
    }
}
