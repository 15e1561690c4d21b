use anyhow::Result;
use std::path::Path;

use super::vault::Vault;

pub async fn run(base_dir: &Path, cli_passphrase: &Option<String>, id: &str) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let record = vault.store.get(id)?;
    let secret = vault.store.get_secret(id).await?;
    eprintln!("{} @ {}", record.username, record.device_scope);
    println!("{}", secret.as_str());
    Ok(())
}
