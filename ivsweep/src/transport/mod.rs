//! Concrete implementations of the [`Instrument`](crate::instrument::Instrument) capability.

pub mod sim;
pub mod tcp;
