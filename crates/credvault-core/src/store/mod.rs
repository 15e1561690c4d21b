pub mod queries;
pub mod runs;
pub mod scan;
pub mod schema;

pub use queries::CredentialStore;
pub use scan::GenerationScan;
