pub mod envelope;

pub use envelope::{EnvelopeCipher, EnvelopeHeader, ENVELOPE_VERSION};
