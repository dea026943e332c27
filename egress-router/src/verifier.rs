//! Proof that a registering instance controls its claimed identity.
//!
//! Identities are account addresses. The instance signs its own address as a personal
//! message (`"\x19Ethereum Signed Message:\n" + len + message`, hashed with Keccak-256)
//! and the relay recovers the signer's secp256k1 public key from the 65 byte
//! `r || s || v` signature. The identity is accepted only if it is `0x` prefixed and the
//! address derived from the recovered key matches it.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";
const SIGNATURE_LEN: usize = 65;

#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
    #[error("signature is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("signature must be 65 bytes, got {0}")]
    Length(usize),

    #[error("invalid recovery id {0}")]
    RecoveryId(u8),

    #[error("could not recover public key: {0}")]
    Recovery(#[from] k256::ecdsa::Error),
}

/// Returns true only if `signature` was produced by the key behind `identity`.
/// Malformed signatures are rejected, never raised.
pub fn verify(identity: &str, signature: &str) -> bool {
    // Unprefixed addresses would register under a second key for the same account
    if !identity.starts_with("0x") {
        tracing::debug!(identity, "Identity is missing its 0x prefix");
        return false;
    }

    match recover_address(identity, signature) {
        Ok(address) => strip_hex_prefix(&address).eq_ignore_ascii_case(strip_hex_prefix(identity)),
        Err(e) => {
            tracing::debug!(identity, error = %e, "Signature could not be recovered");
            false
        }
    }
}

/// Recovers the address that signed `message`.
pub fn recover_address(message: &str, signature: &str) -> Result<String, SignatureError> {
    let bytes = hex::decode(strip_hex_prefix(signature.trim()))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(SignatureError::Length(bytes.len()));
    }

    let v = bytes[64];
    // Both the legacy (27/28) and raw (0/1) encodings of v are in use
    let recovery_byte = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        _ => return Err(SignatureError::RecoveryId(v)),
    };
    let recovery_id = RecoveryId::from_byte(recovery_byte).ok_or(SignatureError::RecoveryId(v))?;
    let signature = Signature::from_slice(&bytes[..64])?;

    let key = VerifyingKey::recover_from_prehash(&message_digest(message), &signature, recovery_id)?;
    Ok(address_of(&key))
}

/// Keccak-256 of the personal-message framing of `message`.
pub fn message_digest(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX.as_bytes());
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Lowercase `0x` address: the last 20 bytes of the Keccak-256 of the uncompressed key.
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    // Skip the 0x04 SEC1 tag
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    /// Creates a signing key and its address from a fixed seed byte.
    pub(crate) fn test_key(seed: u8) -> (SigningKey, String) {
        let key = SigningKey::from_slice(&[seed; 32]).unwrap();
        let address = address_of(key.verifying_key());
        (key, address)
    }

    /// Signs `message` the way wallets do for personal messages, returning `0x` hex.
    pub(crate) fn sign(key: &SigningKey, message: &str) -> String {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&message_digest(message))
            .unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        format!("0x{}", hex::encode(bytes))
    }

    #[test]
    fn test_known_vector() {
        // Widely published web3 example account
        let key = SigningKey::from_slice(
            &hex::decode("4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            address_of(key.verifying_key()),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );

        assert_eq!(
            hex::encode(message_digest("Some data")),
            "1da44b586eb0729ff70a73c326926f6ed5a25f5b056e7f47fbc6e58d86871655"
        );

        let signature = "0xb91467e570a6466aa9e9876cbcd013baba02900b8979d43fe208a4a4f339f5fd\
                         6007e74cd82e037b800186422fc2da167c747ef045e5d18a5f5d4300f8e1a0291c";
        assert_eq!(
            recover_address("Some data", signature).unwrap(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
    }

    #[test]
    fn test_verify_valid_signature() {
        for seed in [1u8, 7, 42, 200] {
            let (key, address) = test_key(seed);
            let signature = sign(&key, &address);
            assert!(verify(&address, &signature));
            assert!(verify(&address, signature.trim_start_matches("0x")));

            // Checksummed or upper-case addresses match the lower-case derived address
            let upper = format!("0x{}", address[2..].to_uppercase());
            assert!(verify(&upper, &sign(&key, &upper)));
        }
    }

    #[test]
    fn test_identity_requires_prefix() {
        let (key, address) = test_key(5);
        let bare = address.trim_start_matches("0x");
        assert!(!verify(bare, &sign(&key, bare)));
        assert!(!verify(bare, &sign(&key, &address)));
        assert!(verify(&address, &sign(&key, &address)));
    }

    #[test]
    fn test_verify_raw_recovery_id() {
        let (key, address) = test_key(3);
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&message_digest(&address))
            .unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte());
        assert!(verify(&address, &hex::encode(bytes)));
    }

    #[test]
    fn test_signature_for_other_identity() {
        let (key, _address) = test_key(1);
        let (_other_key, other_address) = test_key(2);

        // Signed by key 1, claiming identity 2
        let signature = sign(&key, &other_address);
        assert!(!verify(&other_address, &signature));
    }

    #[test]
    fn test_single_byte_flip_rejected() {
        let (key, address) = test_key(9);
        let signature = sign(&key, &address);
        let bytes = hex::decode(signature.trim_start_matches("0x")).unwrap();

        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            assert!(
                !verify(&address, &hex::encode(&tampered)),
                "flipping byte {i} was accepted"
            );
        }
    }

    #[test]
    fn test_malformed_signatures() {
        let (_key, address) = test_key(5);

        assert!(!verify(&address, ""));
        assert!(!verify(&address, "0x"));
        assert!(!verify(&address, "not hex at all"));
        assert!(!verify(&address, &"ab".repeat(64)));
        assert!(!verify(&address, &"ab".repeat(66)));
        // Zero r and s can never be recovered
        assert!(!verify(&address, &format!("{}1b", "00".repeat(64))));

        assert!(matches!(
            recover_address(&address, &"ab".repeat(64)),
            Err(SignatureError::Length(64))
        ));
        assert!(matches!(
            recover_address(&address, &format!("{}05", "11".repeat(64))),
            Err(SignatureError::RecoveryId(5))
        ));
    }
}
