use anyhow::Result;
use std::path::Path;

use credvault_core::types::NewCredential;

use super::vault::Vault;

pub struct PutArgs<'a> {
    pub scope: &'a str,
    pub username: &'a str,
    pub secret: &'a Option<String>,
    pub id: Option<&'a str>,
    pub priority: i64,
    pub protected: bool,
}

pub async fn run(base_dir: &Path, cli_passphrase: &Option<String>, args: PutArgs<'_>) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let secret = crate::get_secret(args.secret)?;

    let mut new = NewCredential::new(args.scope, args.username, &secret).with_priority(args.priority);
    if let Some(id) = args.id {
        new = new.with_id(id);
    }
    if args.protected {
        new = new.protected();
    }

    let record = vault.store.put(new).await?;
    println!(
        "Stored {} for {} (scope {}, key generation {})",
        record.id, record.username, record.device_scope, record.key_generation
    );
    Ok(())
}
