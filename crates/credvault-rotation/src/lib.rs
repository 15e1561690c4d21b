pub mod manager;
pub mod reencrypt;
pub mod schedule;

pub use manager::{RotationManager, RotationPolicy};
pub use reencrypt::{PassReport, Progress, ReEncryptionEngine};
