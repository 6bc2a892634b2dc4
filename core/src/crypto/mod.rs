/// Content encryption and the application-level envelope
pub mod encryption;
pub mod envelope;

pub use encryption::{decrypt, encrypt};
pub use envelope::{decode_envelope, encode_envelope, ContentEnvelope, ContentKind};
