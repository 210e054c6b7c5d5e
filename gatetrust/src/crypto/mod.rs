// Crypto module declarations

pub mod aead;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod x25519;
