//! Shared primitives for the Aura relay. Every connection, client or
//! provider, speaks the same [`Envelope`] so the broker never has to know
//! which side produced a frame in order to parse it.

mod envelope;

pub use envelope::{Action, Envelope, EnvelopeError, GenerateRequest};
