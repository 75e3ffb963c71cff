//! Request signing for providers that authenticate with access/secret key pairs.

pub mod sigv4;

pub use sigv4::{SigV4Headers, SigV4Signer, SigV4SigningResult, SigV4Timestamp};
