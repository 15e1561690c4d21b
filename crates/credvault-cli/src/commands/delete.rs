use anyhow::Result;
use std::path::Path;

use credvault_core::VaultError;

use super::vault::Vault;

pub fn run(base_dir: &Path, cli_passphrase: &Option<String>, id: &str, force: bool) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    match vault.store.delete(id, force) {
        Ok(()) => {
            println!("Deleted {id}");
            Ok(())
        }
        Err(VaultError::ProtectedRecord(_)) => {
            anyhow::bail!("{id} is system-protected; pass --force to delete it anyway")
        }
        Err(e) => Err(e.into()),
    }
}
