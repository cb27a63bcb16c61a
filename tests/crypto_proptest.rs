use proptest::prelude::*;

use agentmesh::crypto;
use ed25519_dalek::SigningKey;

/// Deterministic Ed25519 keypair (seed bytes, public key bytes).
fn keypair(seed: u64) -> ([u8; 32], [u8; 32]) {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    let signing = SigningKey::from_bytes(&bytes);
    (bytes, signing.verifying_key().to_bytes())
}

proptest! {
    /// Any plaintext survives an encrypt then decrypt under the shared key.
    #[test]
    fn roundtrip_any_text(text in ".{0,2000}", seed_a in 1u64..1000, seed_b in 1000u64..2000) {
        let (sk_a, _) = keypair(seed_a);
        let (_, pk_b) = keypair(seed_b);
        let key = crypto::conversation_key(&sk_a, &pk_b).expect("derive");

        let armored = crypto::encrypt(&text, &key).expect("encrypt");
        prop_assert_eq!(crypto::decrypt(&armored, &key).expect("decrypt"), text);
    }

    /// Both directions of a conversation derive the identical key.
    #[test]
    fn conversation_key_symmetry(seed_a in 1u64..1000, seed_b in 1000u64..2000) {
        let (sk_a, pk_a) = keypair(seed_a);
        let (sk_b, pk_b) = keypair(seed_b);

        let ab = crypto::conversation_key(&sk_a, &pk_b).expect("derive a->b");
        let ba = crypto::conversation_key(&sk_b, &pk_a).expect("derive b->a");
        prop_assert_eq!(ab, ba);
    }

    /// Flipping any single ciphertext byte breaks authentication.
    #[test]
    fn tampering_is_detected(text in ".{1,200}", flip in 0usize..100) {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

        let key = [7u8; 32];
        let armored = crypto::encrypt(&text, &key).expect("encrypt");

        let mut raw = BASE64.decode(&armored).expect("armor is base64");
        // Skip the version byte; flipping it fails for a different reason.
        let index = 1 + (flip % (raw.len() - 1));
        raw[index] ^= 0x01;
        let tampered = BASE64.encode(raw);

        prop_assert!(crypto::decrypt(&tampered, &key).is_err());
    }

    /// A third party's key never opens a conversation it is not part of.
    #[test]
    fn outsider_cannot_decrypt(text in ".{0,200}", seed_c in 2000u64..3000) {
        let (sk_a, _) = keypair(1);
        let (_, pk_b) = keypair(2);
        let (sk_c, _) = keypair(seed_c);

        let key = crypto::conversation_key(&sk_a, &pk_b).expect("derive");
        let armored = crypto::encrypt(&text, &key).expect("encrypt");

        let outsider_key = crypto::conversation_key(&sk_c, &pk_b).expect("derive outsider");
        prop_assert!(crypto::decrypt(&armored, &outsider_key).is_err());
    }
}
