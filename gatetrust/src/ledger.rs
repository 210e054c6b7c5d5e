// Registration ledger: one-time tokens, pairing codes and device trust state.
//
// Lifecycle of a record:
//
//   issue_token / issue_pairing_code      -> Pending   (hash only, expires)
//   consume_token                         -> Registered (device bound)
//   block                                 -> Blocked
//   unblock                               -> Registered
//   delete                                -> removed
//
// Raw tokens are handed to the caller exactly once and never stored. Each
// record sits behind its own mutex; the id/hash/device indexes are only held
// long enough to find or swap an entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::hash::{b64url_encode, hash_sha256, to_hex};
use crate::crypto::identity::fingerprint;
use crate::error::{GateTrustError, Result};

/// Default lifetime of a registration token (24 hours).
pub const DEFAULT_TOKEN_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Default lifetime of a pairing code (5 minutes).
pub const DEFAULT_PAIRING_TTL_MS: u64 = 5 * 60 * 1000;

const TOKEN_BYTES: usize = 32;
const PAIRING_CODE_SPACE: u32 = 1_000_000;
const MAX_CODE_ATTEMPTS: usize = 16;

/// Trust state of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
    Pending,
    Registered,
    Blocked,
}

impl RegistrationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Registered => "registered",
            RegistrationStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the one-time secret was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// 32 random bytes, base64url.
    RegistrationToken,
    /// Six decimal digits, short-lived.
    PairingCode,
}

/// One registration record. Outlives any live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistration {
    pub id: Uuid,
    pub user_id: String,
    pub kind: TokenKind,
    /// Lower-case hex SHA-256 of the raw token.
    pub token_hash: String,
    pub status: RegistrationStatus,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    /// Ed25519 device identity bound at registration.
    pub identity_key: Option<[u8; 32]>,
    pub fingerprint: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub registered_at: Option<u64>,
    pub last_seen_at: Option<u64>,
    pub blocked_at: Option<u64>,
    pub block_reason: Option<String>,
}

/// A freshly issued secret. The raw value exists only here.
pub struct IssuedToken {
    pub registration_id: Uuid,
    pub token: String,
    pub expires_at: u64,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("registration_id", &self.registration_id)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What an agent presents when redeeming a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub identity_key: [u8; 32],
    pub device_name: Option<String>,
    pub platform: Option<String>,
}

/// Notified synchronously when a device loses its trust (block or delete).
pub trait RevocationHook: Send + Sync {
    fn device_revoked(&self, device_id: &str, reason: &str);
}

/// Hex SHA-256 of a raw token as stored in the ledger.
pub fn hash_token(raw: &str) -> String {
    to_hex(&hash_sha256(raw.as_bytes()))
}

type Entry = Arc<Mutex<AgentRegistration>>;

/// Concurrent registration store.
pub struct RegistrationLedger {
    records: RwLock<HashMap<Uuid, Entry>>,
    by_token: RwLock<HashMap<String, Uuid>>,
    by_device: RwLock<HashMap<String, Uuid>>,
    hooks: RwLock<Vec<Arc<dyn RevocationHook>>>,
    token_ttl_ms: u64,
    pairing_ttl_ms: u64,
}

impl Default for RegistrationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL_MS, DEFAULT_PAIRING_TTL_MS)
    }
}

impl RegistrationLedger {
    pub fn new(token_ttl_ms: u64, pairing_ttl_ms: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            by_token: RwLock::new(HashMap::new()),
            by_device: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            token_ttl_ms,
            pairing_ttl_ms,
        }
    }

    /// Register a hook fired on block/delete.
    pub fn add_revocation_hook(&self, hook: Arc<dyn RevocationHook>) {
        self.hooks.write().push(hook);
    }

    // ── Issuing ─────────────────────────────────────────────────────────

    /// Issue a one-time registration token for `user_id`.
    pub fn issue_token(&self, user_id: &str, now: u64) -> IssuedToken {
        let mut raw = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);
        let token = b64url_encode(&raw);
        self.insert_pending(user_id, token, TokenKind::RegistrationToken, now + self.token_ttl_ms, now)
    }

    /// Issue a six-digit pairing code for `user_id`.
    ///
    /// Retries on the unlikely collision with another outstanding code.
    pub fn issue_pairing_code(&self, user_id: &str, now: u64) -> Result<IssuedToken> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = format!("{:06}", OsRng.gen_range(0..PAIRING_CODE_SPACE));
            if !self.by_token.read().contains_key(&hash_token(&code)) {
                return Ok(self.insert_pending(user_id, code, TokenKind::PairingCode, now + self.pairing_ttl_ms, now));
            }
        }
        Err(GateTrustError::Storage("pairing code space exhausted".into()))
    }

    fn insert_pending(&self, user_id: &str, token: String, kind: TokenKind, expires_at: u64, now: u64) -> IssuedToken {
        let id = Uuid::new_v4();
        let token_hash = hash_token(&token);
        let record = AgentRegistration {
            id,
            user_id: user_id.to_string(),
            kind,
            token_hash: token_hash.clone(),
            status: RegistrationStatus::Pending,
            device_id: None,
            device_name: None,
            platform: None,
            identity_key: None,
            fingerprint: None,
            created_at: now,
            expires_at,
            registered_at: None,
            last_seen_at: None,
            blocked_at: None,
            block_reason: None,
        };
        self.records.write().insert(id, Arc::new(Mutex::new(record)));
        self.by_token.write().insert(token_hash, id);
        info!(registration_id = %id, user_id, ?kind, "registration token issued");
        IssuedToken {
            registration_id: id,
            token,
            expires_at,
        }
    }

    // ── Consuming ───────────────────────────────────────────────────────

    /// Redeem a raw token and bind `device` to the pending record.
    ///
    /// Single use: the token hash is unlinked on success, so a second call
    /// fails with `InvalidOrExpiredToken`. Expired records are dropped.
    ///
    /// Lock order: an index lock is never taken while a record mutex is
    /// held. The device slot is claimed first and released again if the
    /// record turns out to be spent.
    pub fn consume_token(&self, raw_token: &str, device: DeviceInfo, now: u64) -> Result<AgentRegistration> {
        let token_hash = hash_token(raw_token);
        let id = self
            .by_token
            .read()
            .get(&token_hash)
            .copied()
            .ok_or(GateTrustError::InvalidOrExpiredToken)?;
        let entry = self.entry(&id).ok_or(GateTrustError::InvalidOrExpiredToken)?;

        self.claim_device(&device.device_id, id)?;

        let mut record = entry.lock();
        if record.status != RegistrationStatus::Pending {
            drop(record);
            self.release_device(&device.device_id, &id);
            return Err(GateTrustError::InvalidOrExpiredToken);
        }
        if now > record.expires_at {
            drop(record);
            self.release_device(&device.device_id, &id);
            self.remove_record(&id, Some(&token_hash), None);
            debug!(registration_id = %id, "expired token presented");
            return Err(GateTrustError::InvalidOrExpiredToken);
        }

        record.status = RegistrationStatus::Registered;
        record.fingerprint = Some(fingerprint(&device.identity_key));
        record.identity_key = Some(device.identity_key);
        record.device_id = Some(device.device_id);
        record.device_name = device.device_name;
        record.platform = device.platform;
        record.registered_at = Some(now);
        record.last_seen_at = Some(now);
        let registered = record.clone();
        drop(record);

        self.by_token.write().remove(&token_hash);
        info!(
            registration_id = %id,
            device_id = registered.device_id.as_deref().unwrap_or_default(),
            "device registered"
        );
        Ok(registered)
    }

    // ── Handshake-time checks ───────────────────────────────────────────

    /// Identity key of a registered, unblocked device.
    pub fn verify_device(&self, device_id: &str) -> Result<[u8; 32]> {
        let entry = self
            .device_entry(device_id)
            .ok_or_else(|| GateTrustError::UnknownDevice(device_id.to_string()))?;
        let record = entry.lock();
        match record.status {
            RegistrationStatus::Blocked => Err(GateTrustError::DeviceBlocked),
            RegistrationStatus::Pending => Err(GateTrustError::UnknownDevice(device_id.to_string())),
            RegistrationStatus::Registered => record
                .identity_key
                .ok_or_else(|| GateTrustError::UnknownDevice(device_id.to_string())),
        }
    }

    pub fn is_blocked(&self, device_id: &str) -> bool {
        self.device_entry(device_id)
            .map(|e| e.lock().status == RegistrationStatus::Blocked)
            .unwrap_or(false)
    }

    /// Record activity for `device_id`.
    pub fn touch(&self, device_id: &str, now: u64) {
        if let Some(entry) = self.device_entry(device_id) {
            entry.lock().last_seen_at = Some(now);
        }
    }

    // ── Administration ──────────────────────────────────────────────────

    /// Block a device. Live sessions are torn down through the revocation
    /// hooks before this returns.
    pub fn block(&self, device_id: &str, reason: &str, now: u64) -> Result<()> {
        let entry = self
            .device_entry(device_id)
            .ok_or_else(|| GateTrustError::UnknownDevice(device_id.to_string()))?;
        {
            let mut record = entry.lock();
            if record.status == RegistrationStatus::Pending {
                return Err(GateTrustError::InvalidStateTransition {
                    from: record.status.to_string(),
                    to: RegistrationStatus::Blocked.to_string(),
                });
            }
            record.status = RegistrationStatus::Blocked;
            record.blocked_at = Some(now);
            record.block_reason = Some(reason.to_string());
        }
        warn!(device_id, reason, "device blocked");
        self.notify(device_id, reason);
        Ok(())
    }

    /// Restore a blocked device to `Registered`. No-op for registered devices.
    pub fn unblock(&self, device_id: &str) -> Result<()> {
        let entry = self
            .device_entry(device_id)
            .ok_or_else(|| GateTrustError::UnknownDevice(device_id.to_string()))?;
        let mut record = entry.lock();
        match record.status {
            RegistrationStatus::Blocked => {
                record.status = RegistrationStatus::Registered;
                record.blocked_at = None;
                record.block_reason = None;
                info!(device_id, "device unblocked");
                Ok(())
            }
            RegistrationStatus::Registered => Ok(()),
            RegistrationStatus::Pending => Err(GateTrustError::InvalidStateTransition {
                from: record.status.to_string(),
                to: RegistrationStatus::Registered.to_string(),
            }),
        }
    }

    /// Remove a device's registration entirely and end its live session.
    pub fn delete(&self, device_id: &str) -> Result<AgentRegistration> {
        let id = self
            .by_device
            .read()
            .get(device_id)
            .copied()
            .ok_or_else(|| GateTrustError::UnknownDevice(device_id.to_string()))?;
        let removed = self
            .remove_record(&id, None, Some(device_id))
            .ok_or_else(|| GateTrustError::UnknownDevice(device_id.to_string()))?;
        info!(device_id, "registration deleted");
        self.notify(device_id, "registration deleted");
        Ok(removed)
    }

    /// Remove every registration owned by `user_id`; returns how many.
    pub fn revoke_all_for_user(&self, user_id: &str) -> usize {
        let owned = self.list_for_user(user_id);
        let mut count = 0;
        for record in owned {
            match record.device_id {
                Some(device_id) => {
                    if self.delete(&device_id).is_ok() {
                        count += 1;
                    }
                }
                None => {
                    if self.remove_record(&record.id, Some(&record.token_hash), None).is_some() {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Drop pending records past their expiry. Returns how many went.
    pub fn purge_expired(&self, now: u64) -> usize {
        let expired: Vec<(Uuid, String)> = self
            .snapshot()
            .iter()
            .filter_map(|e| {
                let r = e.lock();
                let expired = r.status == RegistrationStatus::Pending && now > r.expires_at;
                let hit = if expired { Some((r.id, r.token_hash.clone())) } else { None };
                hit
            })
            .collect();
        let count = expired.len();
        for (id, hash) in expired {
            self.remove_record(&id, Some(&hash), None);
        }
        if count > 0 {
            debug!(count, "purged expired registration tokens");
        }
        count
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Snapshot of a device's registration.
    pub fn get(&self, device_id: &str) -> Option<AgentRegistration> {
        self.device_entry(device_id).map(|e| e.lock().clone())
    }

    pub fn get_by_id(&self, id: &Uuid) -> Option<AgentRegistration> {
        self.entry(id).map(|e| e.lock().clone())
    }

    /// All records owned by `user_id`, oldest first.
    pub fn list_for_user(&self, user_id: &str) -> Vec<AgentRegistration> {
        let mut out: Vec<AgentRegistration> = self
            .snapshot()
            .iter()
            .map(|e| e.lock().clone())
            .filter(|r| r.user_id == user_id)
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Every entry, with the index lock already released.
    fn snapshot(&self) -> Vec<Entry> {
        self.records.read().values().cloned().collect()
    }

    /// Reserve `device_id` for record `id`, or report who holds it.
    fn claim_device(&self, device_id: &str, id: Uuid) -> Result<()> {
        let existing = {
            let mut by_device = self.by_device.write();
            match by_device.get(device_id).copied() {
                Some(existing) => existing,
                None => {
                    by_device.insert(device_id.to_string(), id);
                    return Ok(());
                }
            }
        };
        let blocked = self
            .entry(&existing)
            .map(|e| e.lock().status == RegistrationStatus::Blocked)
            .unwrap_or(false);
        Err(if blocked {
            GateTrustError::DeviceBlocked
        } else {
            GateTrustError::DeviceIdInUse(device_id.to_string())
        })
    }

    fn release_device(&self, device_id: &str, id: &Uuid) {
        let mut by_device = self.by_device.write();
        if by_device.get(device_id) == Some(id) {
            by_device.remove(device_id);
        }
    }

    fn entry(&self, id: &Uuid) -> Option<Entry> {
        self.records.read().get(id).cloned()
    }

    fn device_entry(&self, device_id: &str) -> Option<Entry> {
        let id = self.by_device.read().get(device_id).copied()?;
        self.entry(&id)
    }

    fn remove_record(&self, id: &Uuid, token_hash: Option<&str>, device_id: Option<&str>) -> Option<AgentRegistration> {
        if let Some(hash) = token_hash {
            self.by_token.write().remove(hash);
        }
        if let Some(device_id) = device_id {
            self.by_device.write().remove(device_id);
        }
        let entry = self.records.write().remove(id)?;
        let record = entry.lock().clone();
        Some(record)
    }

    fn notify(&self, device_id: &str, reason: &str) {
        let hooks: Vec<Arc<dyn RevocationHook>> = self.hooks.read().clone();
        for hook in hooks {
            hook.device_revoked(device_id, reason);
        }
    }
}
