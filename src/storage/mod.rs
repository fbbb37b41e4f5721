//! Versioned, swappable storage for ingested chain data

pub mod generation;

pub use generation::{DbGeneration, GenerationRegistry, Generations, StoreKind};
