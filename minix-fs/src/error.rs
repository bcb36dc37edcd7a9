/// Failures returned to the immediate caller of a file system operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum FsError {
    /// the superblock magic does not match, mount refused
    #[error("bad minix3 superblock")]
    InvalidSuperblock,
    /// no free inode number or zone left
    #[error("no free inode or zone left")]
    ResourceExhausted,
    /// the inode already carries the maximum link count
    #[error("too many links")]
    LinkLimit,
    /// logical zone beyond what triple indirection can address
    #[error("file offset beyond format capacity")]
    CapacityExceeded,
    /// no directory entry matches
    #[error("no such file or directory")]
    NotFound,
    /// a directory entry with that name exists
    #[error("file exists")]
    AlreadyExists,
    /// a directory was expected
    #[error("not a directory")]
    NotDirectory,
    /// the operation does not apply to directories
    #[error("is a directory")]
    IsDirectory,
    /// the directory still has entries besides "." and ".."
    #[error("directory not empty")]
    NotEmpty,
    /// name longer than the directory entry name field
    #[error("file name too long")]
    NameTooLong,
    /// malformed name, offset or inode number
    #[error("invalid argument")]
    InvalidArgument,
    /// every cached vnode is in use
    #[error("vnode cache full")]
    CacheFull,
    /// the vnode was destroyed after its last link went away
    #[error("stale vnode")]
    Stale,
    /// the file was not opened for this direction of transfer
    #[error("bad file access mode")]
    AccessDenied,
}

/// Result of a file system operation
pub type FsResult<T> = Result<T, FsError>;
