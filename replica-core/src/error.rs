use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PointerError {
    #[error("Pointer must start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("Invalid escape in pointer segment: {0:?}")]
    BadEscape(String),
    #[error("Invalid sequence index: {0:?}")]
    BadIndex(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("Malformed path: {0}")]
    Pointer(#[from] PointerError),
    #[error("Path not found: {0}")]
    NotFound(String),
    #[error("Parent of {0} is not a container")]
    NotContainer(String),
    #[error("Index out of bounds at {path}: {index} (len {len})")]
    OutOfBounds { path: String, index: usize, len: usize },
    #[error("Test failed at {0}")]
    TestFailed(String),
    #[error("Operation {op} needs a value")]
    MissingValue { op: &'static str },
    #[error("Operation {op} is not valid on the document root")]
    InvalidRootOp { op: &'static str },
    #[error("Unknown op code: {0:?}")]
    UnknownCode(char),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackError {
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),
    #[error("Unknown fast-patch field: {0}")]
    UnknownField(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Buffer truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Dictionary id {0} missing from batch dictionary")]
    UnknownDictId(u32),
    #[error("Unknown fast-patch field: {0}")]
    UnknownField(String),
}
