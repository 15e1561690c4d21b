use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, VaultError};
use crate::types::{BackupHandle, Generation, KeyBytes, KeyInfo, KeyRecord};

/// Answers "how many credentials still reference this generation".
///
/// Implemented by the credential store; the key store asks it before
/// pruning so a referenced generation is never destroyed.
pub trait GenerationReferences: Send + Sync {
    fn references(&self, generation: Generation) -> Result<u64>;
}

/// Trait for key material backends.
///
/// Exactly one generation is Active at a time. Retired generations stay
/// readable until they are backed up and pruned.
#[async_trait]
pub trait KeyMaterialStore: Send + Sync {
    /// The currently active key. `NoActiveKey` if the store is empty.
    async fn get_active(&self) -> Result<KeyRecord>;

    /// A specific generation (for decrypting older records).
    async fn get(&self, generation: Generation) -> Result<KeyRecord>;

    /// The Active key, held in place until the returned pin is dropped: no
    /// activation or prune completes in between. Writers seal and store a
    /// secret under one pin.
    async fn pin_active(&self) -> Result<PinnedKey> {
        Ok(PinnedKey::new(self.get_active().await?, None))
    }

    /// Insert `material` as generation max+1, Active, and demote the prior
    /// Active key to Retired in one step.
    ///
    /// Takes the rotation flag; the returned lease holds it until dropped.
    async fn create_and_activate(&self, material: KeyBytes) -> Result<(KeyRecord, RotationLease)>;

    /// Take the rotation flag without activating anything.
    fn acquire_rotation(&self) -> Result<RotationLease>;

    /// True while this handle holds a lease.
    fn rotation_in_progress(&self) -> bool;

    /// Persist a retired generation out of band. Repeating it is a no-op.
    async fn backup(&self, generation: Generation) -> Result<BackupHandle>;

    /// Reload a backed-up generation from its backup artifact.
    async fn restore(&self, generation: Generation) -> Result<KeyInfo>;

    /// Remove a retired, backed-up generation nobody references any more.
    async fn prune(&self, generation: Generation, refs: &dyn GenerationReferences) -> Result<()>;

    /// Metadata for every generation, oldest first.
    async fn list(&self) -> Result<Vec<KeyInfo>>;
}

/// Process-wide "rotation in progress" flag.
#[derive(Debug, Clone, Default)]
pub struct RotationFlag {
    busy: Arc<AtomicBool>,
}

impl RotationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set. Fails with `ConcurrentRotation` if already held.
    pub fn try_acquire(&self) -> Result<RotationLease> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| VaultError::ConcurrentRotation)?;
        Ok(RotationLease {
            busy: Arc::clone(&self.busy),
            hold: None,
        })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Opaque guard kept alive alongside a lease or pin, e.g. a file lock.
pub type HeldGuard = Box<dyn Send + Sync>;

/// Exclusive right to rotate. Releases the flag on drop, on every path.
#[must_use = "dropping the lease ends the rotation"]
pub struct RotationLease {
    busy: Arc<AtomicBool>,
    hold: Option<HeldGuard>,
}

impl RotationLease {
    /// Keep `guard` alive for as long as the lease. It is released first
    /// on drop.
    pub fn holding(mut self, guard: impl Send + Sync + 'static) -> Self {
        self.hold = Some(Box::new(guard));
        self
    }
}

impl fmt::Debug for RotationLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationLease")
            .field("guarded", &self.hold.is_some())
            .finish()
    }
}

impl Drop for RotationLease {
    fn drop(&mut self) {
        drop(self.hold.take());
        self.busy.store(false, Ordering::Release);
    }
}

/// The Active key plus whatever keeps it Active, see
/// [`KeyMaterialStore::pin_active`].
#[must_use = "the key is only pinned while this is alive"]
pub struct PinnedKey {
    key: KeyRecord,
    _hold: Option<HeldGuard>,
}

impl PinnedKey {
    pub fn new(key: KeyRecord, hold: Option<HeldGuard>) -> Self {
        Self { key, _hold: hold }
    }

    pub fn key(&self) -> &KeyRecord {
        &self.key
    }
}
