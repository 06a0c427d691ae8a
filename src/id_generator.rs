use crate::session::{SessionId, DEFAULT_SESSION_ID_LENGTH};
use rand::distributions::{Alphanumeric, DistString};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A type with the ability to generate session ids.
pub trait SessionIdGenerator: Debug + Send + Sync {
    /// Generate a session id, i.e. a string that is a valid HTTP cookie value.
    fn generate_id(&self) -> SessionId;
}

/// The default session id generator with focus on security.
/// It uses [`rand::thread_rng`] as a random source and the [Alphanumeric] distribution to generate ids.
/// This gives `log_2(26+26+10) ≥ 5.95` bits of entropy per character.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSessionIdGenerator<const ID_LENGTH: usize = DEFAULT_SESSION_ID_LENGTH>;

impl<const ID_LENGTH: usize> SessionIdGenerator for DefaultSessionIdGenerator<ID_LENGTH> {
    fn generate_id(&self) -> SessionId {
        Alphanumeric
            .sample_string(&mut rand::thread_rng(), ID_LENGTH)
            .into()
    }
}

/// A debug session id generator that generates an ascending sequence of integers, formatted as strings padded with zeroes.
///
/// **Never use this outside of tests**, its ids are trivially guessable.
#[derive(Debug, Default)]
pub struct DebugSessionIdGenerator<const ID_LENGTH: usize = DEFAULT_SESSION_ID_LENGTH> {
    next_index: AtomicUsize,
}

impl<const ID_LENGTH: usize> DebugSessionIdGenerator<ID_LENGTH> {
    /// Returns the id generated by the `index`th call to [`generate_id`](SessionIdGenerator::generate_id),
    /// starting at zero.
    pub fn nth_id(index: usize) -> SessionId {
        format!("{index:0width$}", width = ID_LENGTH).into()
    }
}

impl<const ID_LENGTH: usize> SessionIdGenerator for DebugSessionIdGenerator<ID_LENGTH> {
    fn generate_id(&self) -> SessionId {
        Self::nth_id(self.next_index.fetch_add(1, Ordering::Relaxed))
    }
}
