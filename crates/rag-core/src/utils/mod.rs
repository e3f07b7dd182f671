pub mod error;
pub mod fingerprint;
pub mod logger;

pub use error::{ClassifiedError, ErrorKind, ErrorResponse, UserAction};
pub use fingerprint::{fingerprint, normalize_text};
