pub mod config;
pub mod delete;
pub mod get;
pub mod init;
pub mod keys;
pub mod list;
pub mod outcome;
pub mod put;
pub mod rotate;
pub mod runs;
pub mod schedule;
pub mod select;
pub mod update_secret;
pub mod vault;
