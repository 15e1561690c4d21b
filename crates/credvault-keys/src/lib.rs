pub mod backup;
pub mod factory;
pub mod local;

pub use factory::{bootstrap_key_from_env, init_key_store, open_key_store};
pub use local::LocalKeyStore;
