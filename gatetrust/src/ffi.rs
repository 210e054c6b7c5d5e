// C FFI bindings for native desktop agents.
//
// All functions return 0 on success, -1 on error.
// Buffers are caller-allocated; lengths are checked. When an output buffer is
// too small its length pointer is updated to the required size.

use std::slice;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::aead::Algorithm;
use crate::crypto::identity::IdentityKeyPair;
use crate::crypto::kdf::derive_keys;
use crate::crypto::x25519::EphemeralKeyPair;
use crate::envelope::{Direction, SealParams, SecureEnvelope};
use crate::now_millis;
use crate::replay::{ReplayGuard, SequenceWindow};

const DIR_C2S: u8 = 0;
const DIR_S2C: u8 = 1;

fn direction_from_ffi(direction: u8) -> Option<Direction> {
    match direction {
        DIR_C2S => Some(Direction::ClientToServer),
        DIR_S2C => Some(Direction::ServerToClient),
        _ => None,
    }
}

fn direction_to_ffi(direction: Direction) -> u8 {
    match direction {
        Direction::ClientToServer => DIR_C2S,
        Direction::ServerToClient => DIR_S2C,
    }
}

unsafe fn read_key(ptr: *const u8) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(unsafe { slice::from_raw_parts(ptr, 32) });
    out
}

/// `len` may be zero with a null pointer.
unsafe fn read_bytes<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { slice::from_raw_parts(ptr, len) })
}

unsafe fn write_out(bytes: &[u8], out: *mut u8, out_len: *mut usize) -> i32 {
    let cap = unsafe { *out_len };
    unsafe { *out_len = bytes.len() };
    if bytes.len() > cap {
        return -1;
    }
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len()) };
    0
}

// ── Key generation ───────────────────────────────────────────────────────

/// Generate a device identity (Ed25519) keypair.
///
/// `public_key_out`: 32-byte buffer for the public key.
/// `seed_out`: 32-byte buffer for the secret seed.
#[no_mangle]
pub unsafe extern "C" fn gatetrust_identity_generate(public_key_out: *mut u8, seed_out: *mut u8) -> i32 {
    if public_key_out.is_null() || seed_out.is_null() {
        return -1;
    }
    let kp = IdentityKeyPair::generate();
    let pk = kp.public_key_bytes();
    let seed = kp.seed();
    unsafe {
        std::ptr::copy_nonoverlapping(pk.as_ptr(), public_key_out, 32);
        std::ptr::copy_nonoverlapping(seed.as_ptr(), seed_out, 32);
    }
    0
}

/// Generate an ephemeral X25519 keypair.
///
/// The secret is written out so the caller can run the agreement later; the
/// caller must wipe it after [`gatetrust_derive_keys`].
#[no_mangle]
pub unsafe extern "C" fn gatetrust_ephemeral_generate(public_out: *mut u8, secret_out: *mut u8) -> i32 {
    if public_out.is_null() || secret_out.is_null() {
        return -1;
    }
    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut secret[..]);
    let public = EphemeralKeyPair::from_secret_bytes(*secret).public_key_bytes();
    unsafe {
        std::ptr::copy_nonoverlapping(public.as_ptr(), public_out, 32);
        std::ptr::copy_nonoverlapping(secret.as_ptr(), secret_out, 32);
    }
    0
}

// ── Key agreement + derivation ───────────────────────────────────────────

/// X25519 with `peer_public`, then HKDF into the three session keys.
///
/// Each of `c2s_out`, `s2c_out`, `auth_out` must hold 32 bytes.
#[no_mangle]
pub unsafe extern "C" fn gatetrust_derive_keys(
    local_secret: *const u8,
    peer_public: *const u8,
    salt: *const u8,
    salt_len: usize,
    context: *const u8,
    context_len: usize,
    c2s_out: *mut u8,
    s2c_out: *mut u8,
    auth_out: *mut u8,
) -> i32 {
    if local_secret.is_null() || peer_public.is_null() || c2s_out.is_null() || s2c_out.is_null() || auth_out.is_null()
    {
        return -1;
    }
    let (Some(salt), Some(context)) = (unsafe { read_bytes(salt, salt_len) }, unsafe {
        read_bytes(context, context_len)
    }) else {
        return -1;
    };

    let secret = Zeroizing::new(unsafe { read_key(local_secret) });
    let peer = unsafe { read_key(peer_public) };
    let shared = match EphemeralKeyPair::from_secret_bytes(*secret).diffie_hellman(&peer) {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let keys = match derive_keys(&shared, salt, context) {
        Ok(k) => k,
        Err(_) => return -1,
    };
    unsafe {
        std::ptr::copy_nonoverlapping(keys.encrypt_client_to_server().as_ptr(), c2s_out, 32);
        std::ptr::copy_nonoverlapping(keys.encrypt_server_to_client().as_ptr(), s2c_out, 32);
        std::ptr::copy_nonoverlapping(keys.auth_key().as_ptr(), auth_out, 32);
    }
    0
}

// ── Envelope seal / open ─────────────────────────────────────────────────

/// Seal `plaintext` into a compact envelope (ASCII, not NUL-terminated).
///
/// `algorithm`: 0x0001 AES-256-GCM, 0x0002 ChaCha20-Poly1305.
/// `direction`: 0 = c2s, 1 = s2c. The timestamp is the current clock.
/// `out_len`: on input the buffer capacity, on output the envelope length.
#[no_mangle]
pub unsafe extern "C" fn gatetrust_envelope_seal(
    algorithm: u16,
    key: *const u8,
    device_id: *const u8,
    device_id_len: usize,
    direction: u8,
    sequence: u64,
    plaintext: *const u8,
    plaintext_len: usize,
    out: *mut u8,
    out_len: *mut usize,
) -> i32 {
    if key.is_null() || device_id.is_null() || out.is_null() || out_len.is_null() {
        return -1;
    }
    let Some(algorithm) = Algorithm::from_ffi_id(algorithm) else {
        return -1;
    };
    let Some(direction) = direction_from_ffi(direction) else {
        return -1;
    };
    let device_id = unsafe { slice::from_raw_parts(device_id, device_id_len) };
    let Ok(device_id) = std::str::from_utf8(device_id) else {
        return -1;
    };
    let Some(plaintext) = (unsafe { read_bytes(plaintext, plaintext_len) }) else {
        return -1;
    };
    let key = Zeroizing::new(unsafe { read_key(key) });

    let params = SealParams {
        algorithm,
        device_id,
        direction,
        sequence,
        timestamp: now_millis(),
    };
    match SecureEnvelope::seal(&key, params, plaintext) {
        Ok(env) => unsafe { write_out(env.to_compact_form().as_bytes(), out, out_len) },
        Err(_) => -1,
    }
}

/// Parse and open a compact envelope.
///
/// On success the authenticated header fields are written to
/// `direction_out` (0 = c2s, 1 = s2c), `timestamp_out` and `sequence_out`
/// so the caller can run [`gatetrust_replay_validate`] before trusting the
/// plaintext. Each header pointer may be null.
#[no_mangle]
pub unsafe extern "C" fn gatetrust_envelope_open(
    key: *const u8,
    compact: *const u8,
    compact_len: usize,
    plaintext_out: *mut u8,
    plaintext_out_len: *mut usize,
    direction_out: *mut u8,
    timestamp_out: *mut u64,
    sequence_out: *mut u64,
) -> i32 {
    if key.is_null() || compact.is_null() || plaintext_out.is_null() || plaintext_out_len.is_null() {
        return -1;
    }
    let compact = unsafe { slice::from_raw_parts(compact, compact_len) };
    let Ok(compact) = std::str::from_utf8(compact) else {
        return -1;
    };
    let Ok(envelope) = SecureEnvelope::from_compact_form(compact) else {
        return -1;
    };
    let key = Zeroizing::new(unsafe { read_key(key) });
    let plaintext = match envelope.open(&key) {
        Ok(pt) => Zeroizing::new(pt),
        Err(_) => return -1,
    };
    if unsafe { write_out(&plaintext, plaintext_out, plaintext_out_len) } != 0 {
        return -1;
    }

    let header = envelope.header();
    unsafe {
        if !direction_out.is_null() {
            *direction_out = direction_to_ffi(header.dir);
        }
        if !timestamp_out.is_null() {
            *timestamp_out = header.ts;
        }
        if !sequence_out.is_null() {
            *sequence_out = header.seq;
        }
    }
    0
}

/// Replay check over a caller-held window.
///
/// `window` points at two `u64` slots: last accepted c2s, then s2c, both 0
/// for a fresh session. The slot for `direction` advances only when the
/// frame is accepted. Returns 0 to accept, -1 to reject.
#[no_mangle]
pub unsafe extern "C" fn gatetrust_replay_validate(
    direction: u8,
    timestamp: u64,
    sequence: u64,
    window: *mut u64,
    now: u64,
    tolerance_ms: u64,
) -> i32 {
    if window.is_null() {
        return -1;
    }
    let Some(direction) = direction_from_ffi(direction) else {
        return -1;
    };
    let slots = unsafe { slice::from_raw_parts_mut(window, 2) };
    let mut seen = SequenceWindow::from_last(slots[0], slots[1]);
    if ReplayGuard::new(tolerance_ms)
        .validate(direction, timestamp, sequence, &mut seen, now)
        .is_err()
    {
        return -1;
    }
    slots[0] = seen.last(Direction::ClientToServer);
    slots[1] = seen.last(Direction::ServerToClient);
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffi_key_agreement_and_envelope() {
        let mut a_pub = [0u8; 32];
        let mut a_sec = [0u8; 32];
        let mut b_pub = [0u8; 32];
        let mut b_sec = [0u8; 32];
        unsafe {
            assert_eq!(gatetrust_ephemeral_generate(a_pub.as_mut_ptr(), a_sec.as_mut_ptr()), 0);
            assert_eq!(gatetrust_ephemeral_generate(b_pub.as_mut_ptr(), b_sec.as_mut_ptr()), 0);
        }

        let salt = b"salt";
        let ctx = b"n3n-agent-v1dev";
        let (mut a_c2s, mut a_s2c, mut a_auth) = ([0u8; 32], [0u8; 32], [0u8; 32]);
        let (mut b_c2s, mut b_s2c, mut b_auth) = ([0u8; 32], [0u8; 32], [0u8; 32]);
        unsafe {
            assert_eq!(
                gatetrust_derive_keys(
                    a_sec.as_ptr(), b_pub.as_ptr(), salt.as_ptr(), salt.len(), ctx.as_ptr(), ctx.len(),
                    a_c2s.as_mut_ptr(), a_s2c.as_mut_ptr(), a_auth.as_mut_ptr(),
                ),
                0
            );
            assert_eq!(
                gatetrust_derive_keys(
                    b_sec.as_ptr(), a_pub.as_ptr(), salt.as_ptr(), salt.len(), ctx.as_ptr(), ctx.len(),
                    b_c2s.as_mut_ptr(), b_s2c.as_mut_ptr(), b_auth.as_mut_ptr(),
                ),
                0
            );
        }
        assert_eq!(a_c2s, b_c2s);
        assert_eq!(a_auth, b_auth);
        assert_ne!(a_c2s, a_s2c);

        let did = b"dev";
        let msg = b"hello native agent";
        let mut env = vec![0u8; 512];
        let mut env_len = env.len();
        unsafe {
            assert_eq!(
                gatetrust_envelope_seal(
                    0x0001, a_c2s.as_ptr(), did.as_ptr(), did.len(), DIR_C2S, 1,
                    msg.as_ptr(), msg.len(), env.as_mut_ptr(), &mut env_len,
                ),
                0
            );
        }

        let mut pt = vec![0u8; 64];
        let mut pt_len = pt.len();
        let (mut dir, mut ts, mut seq) = (u8::MAX, 0u64, 0u64);
        unsafe {
            assert_eq!(
                gatetrust_envelope_open(
                    b_c2s.as_ptr(), env.as_ptr(), env_len, pt.as_mut_ptr(), &mut pt_len,
                    &mut dir, &mut ts, &mut seq,
                ),
                0
            );
        }
        assert_eq!(&pt[..pt_len], msg);
        assert_eq!((dir, seq), (DIR_C2S, 1));

        // The receiver's window accepts the frame once.
        let mut window = [0u64; 2];
        let now = now_millis();
        unsafe {
            assert_eq!(gatetrust_replay_validate(dir, ts, seq, window.as_mut_ptr(), now, 300_000), 0);
        }
        assert_eq!(window, [1, 0]);

        // Delivering the same frame again opens fine but fails the window.
        let mut pt_len = pt.len();
        unsafe {
            assert_eq!(
                gatetrust_envelope_open(
                    b_c2s.as_ptr(), env.as_ptr(), env_len, pt.as_mut_ptr(), &mut pt_len,
                    &mut dir, &mut ts, &mut seq,
                ),
                0
            );
            assert_eq!(gatetrust_replay_validate(dir, ts, seq, window.as_mut_ptr(), now, 300_000), -1);
        }
        assert_eq!(window, [1, 0]);

        // Opening with the other direction's key fails.
        let mut pt_len = pt.len();
        unsafe {
            assert_eq!(
                gatetrust_envelope_open(
                    b_s2c.as_ptr(), env.as_ptr(), env_len, pt.as_mut_ptr(), &mut pt_len,
                    std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut(),
                ),
                -1
            );
        }
    }

    #[test]
    fn replay_window_rejects_stale_and_unknown_direction() {
        let now = 1_700_000_000_000u64;
        let mut window = [0u64; 2];
        unsafe {
            assert_eq!(gatetrust_replay_validate(DIR_S2C, now - 2_000, 1, window.as_mut_ptr(), now, 1_000), -1);
            assert_eq!(gatetrust_replay_validate(7, now, 1, window.as_mut_ptr(), now, 1_000), -1);
            assert_eq!(gatetrust_replay_validate(DIR_S2C, now, 4, window.as_mut_ptr(), now, 1_000), 0);
            assert_eq!(gatetrust_replay_validate(DIR_S2C, now, 3, window.as_mut_ptr(), now, 1_000), -1);
            assert_eq!(gatetrust_replay_validate(DIR_C2S, now, 1, std::ptr::null_mut(), now, 1_000), -1);
        }
        assert_eq!(window, [0, 4]);
    }

    #[test]
    fn small_buffer_reports_required_len() {
        let key = [1u8; 32];
        let did = b"d";
        let mut out = [0u8; 8];
        let mut out_len = out.len();
        let rc = unsafe {
            gatetrust_envelope_seal(
                0x0001, key.as_ptr(), did.as_ptr(), did.len(), DIR_S2C, 1,
                b"x".as_ptr(), 1, out.as_mut_ptr(), &mut out_len,
            )
        };
        assert_eq!(rc, -1);
        assert!(out_len > 8);
    }

    #[test]
    fn null_pointers_rejected() {
        unsafe {
            assert_eq!(gatetrust_identity_generate(std::ptr::null_mut(), std::ptr::null_mut()), -1);
        }
    }
}
