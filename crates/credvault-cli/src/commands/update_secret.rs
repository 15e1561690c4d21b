use anyhow::Result;
use std::path::Path;

use super::vault::Vault;

pub async fn run(
    base_dir: &Path,
    cli_passphrase: &Option<String>,
    id: &str,
    secret: &Option<String>,
) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let secret = crate::get_secret(secret)?;
    let generation = vault.store.update_secret(id, &secret).await?;
    println!("Secret of {id} updated (key generation {generation})");
    Ok(())
}
