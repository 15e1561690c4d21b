//! In-memory key store for unit tests.

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::crypto::fingerprint;
use crate::error::{Result, VaultError};
use crate::keystore::{GenerationReferences, KeyMaterialStore, RotationFlag, RotationLease};
use crate::types::{
    BackupHandle, Generation, KEY_LEN, KeyBytes, KeyInfo, KeyRecord, KeyStatus, now_timestamp,
};

pub struct MemoryKeyStore {
    keys: Mutex<BTreeMap<Generation, KeyRecord>>,
    backups: Mutex<BTreeMap<Generation, KeyRecord>>,
    flag: RotationFlag,
}

pub fn random_material() -> KeyBytes {
    let mut material = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(material.as_mut());
    material
}

impl MemoryKeyStore {
    pub fn empty() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
            backups: Mutex::new(BTreeMap::new()),
            flag: RotationFlag::new(),
        }
    }

    /// Store holding one Active generation.
    pub fn bootstrap() -> Self {
        let store = Self::empty();
        store.keys.lock().unwrap().insert(
            Generation::FIRST,
            KeyRecord {
                generation: Generation::FIRST,
                material: *random_material(),
                created_at: now_timestamp(),
                status: KeyStatus::Active,
            },
        );
        store
    }

    /// Activate a fresh random key, returning the held lease.
    pub async fn activate_random(&self) -> RotationLease {
        let (_, lease) = self.create_and_activate(random_material()).await.unwrap();
        lease
    }
}

#[async_trait]
impl KeyMaterialStore for MemoryKeyStore {
    async fn get_active(&self) -> Result<KeyRecord> {
        self.keys
            .lock()
            .unwrap()
            .values()
            .find(|k| k.status == KeyStatus::Active)
            .cloned()
            .ok_or(VaultError::NoActiveKey)
    }

    async fn get(&self, generation: Generation) -> Result<KeyRecord> {
        self.keys
            .lock()
            .unwrap()
            .get(&generation)
            .cloned()
            .ok_or(VaultError::UnknownGeneration(generation))
    }

    async fn create_and_activate(&self, material: KeyBytes) -> Result<(KeyRecord, RotationLease)> {
        let lease = self.flag.try_acquire()?;
        let mut keys = self.keys.lock().unwrap();
        let generation = keys.keys().next_back().map_or(Generation::FIRST, |g| g.next());
        for key in keys.values_mut() {
            if key.status == KeyStatus::Active {
                key.status = KeyStatus::Retired;
            }
        }
        let record = KeyRecord {
            generation,
            material: *material,
            created_at: now_timestamp(),
            status: KeyStatus::Active,
        };
        keys.insert(generation, record.clone());
        Ok((record, lease))
    }

    fn acquire_rotation(&self) -> Result<RotationLease> {
        self.flag.try_acquire()
    }

    fn rotation_in_progress(&self) -> bool {
        self.flag.is_held()
    }

    async fn backup(&self, generation: Generation) -> Result<BackupHandle> {
        let mut keys = self.keys.lock().unwrap();
        let key = keys
            .get_mut(&generation)
            .ok_or(VaultError::UnknownGeneration(generation))?;
        if key.status == KeyStatus::Active {
            return Err(VaultError::GenerationActive(generation));
        }
        self.backups
            .lock()
            .unwrap()
            .insert(generation, key.clone());
        key.status = KeyStatus::BackedUp;
        Ok(BackupHandle {
            generation,
            location: format!("memory:{generation}"),
            created_at: now_timestamp(),
        })
    }

    async fn restore(&self, generation: Generation) -> Result<KeyInfo> {
        let backup = self
            .backups
            .lock()
            .unwrap()
            .get(&generation)
            .cloned()
            .ok_or(VaultError::UnknownGeneration(generation))?;
        let info = KeyInfo {
            generation,
            status: KeyStatus::BackedUp,
            created_at: backup.created_at.clone(),
            fingerprint: fingerprint(&backup.material),
        };
        self.keys
            .lock()
            .unwrap()
            .entry(generation)
            .or_insert(backup);
        Ok(info)
    }

    async fn prune(&self, generation: Generation, refs: &dyn GenerationReferences) -> Result<()> {
        let references = refs.references(generation)?;
        if references > 0 {
            return Err(VaultError::GenerationInUse {
                generation,
                references,
            });
        }
        let mut keys = self.keys.lock().unwrap();
        match keys.get(&generation).map(|k| k.status) {
            None => Err(VaultError::UnknownGeneration(generation)),
            Some(KeyStatus::Active) => Err(VaultError::GenerationActive(generation)),
            Some(KeyStatus::Retired) => Err(VaultError::GenerationNotBackedUp(generation)),
            Some(KeyStatus::BackedUp) => {
                keys.remove(&generation);
                Ok(())
            }
        }
    }

    async fn list(&self) -> Result<Vec<KeyInfo>> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .values()
            .map(|k| KeyInfo {
                generation: k.generation,
                status: k.status,
                created_at: k.created_at.clone(),
                fingerprint: fingerprint(&k.material),
            })
            .collect())
    }
}
