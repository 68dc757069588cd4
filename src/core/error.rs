use thiserror::Error;

#[derive(Error, Debug)]
pub enum CofferError {
    #[error("Invalid magic number in header")]
    InvalidMagic,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("Corrupt container: {0}")]
    Corrupt(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CofferError>;

impl From<CofferError> for std::io::Error {
    fn from(err: CofferError) -> Self {
        use std::io::ErrorKind;

        match err {
            CofferError::Io(inner) => inner,
            CofferError::NotFound(_) => std::io::Error::new(ErrorKind::NotFound, err),
            CofferError::AlreadyExists(_) => std::io::Error::new(ErrorKind::AlreadyExists, err),
            CofferError::OutOfRange(_) | CofferError::InvalidName(_) => {
                std::io::Error::new(ErrorKind::InvalidInput, err)
            }
            CofferError::InvalidOperation(_) => {
                std::io::Error::new(ErrorKind::PermissionDenied, err)
            }
            CofferError::InvalidMagic
            | CofferError::UnsupportedVersion(_)
            | CofferError::Corrupt(_) => std::io::Error::new(ErrorKind::InvalidData, err),
            _ => std::io::Error::new(ErrorKind::Other, err),
        }
    }
}
