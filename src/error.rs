use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signing failed: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
