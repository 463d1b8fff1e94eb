//! Property-based tests for the signing primitive.

use proptest::prelude::*;

use crate::keys::{generate_key_pair, sign, verify, PrivateKey, PublicKey, Signature};

fn arb_private_key() -> impl Strategy<Value = PrivateKey> {
    any::<[u8; 32]>().prop_map(PrivateKey::from_bytes)
}

proptest! {
    #[test]
    fn test_signature_round_trip(message in any::<Vec<u8>>()) {
        let pair = generate_key_pair();
        let sig = sign(&pair.private_key, &message);
        prop_assert!(verify(&pair.public_key, &message, &sig));
    }

    #[test]
    fn test_signature_round_trip_any_seed(
        key in arb_private_key(),
        message in any::<Vec<u8>>()
    ) {
        let sig = sign(&key, &message);
        prop_assert!(verify(&key.public_key(), &message, &sig));
    }

    #[test]
    fn test_message_mutation_rejected(
        key in arb_private_key(),
        message in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255
    ) {
        let sig = sign(&key, &message);
        let mut tampered = message.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        prop_assert!(!verify(&key.public_key(), &tampered, &sig));
    }

    #[test]
    fn test_signature_mutation_rejected(
        key in arb_private_key(),
        message in any::<Vec<u8>>(),
        index in 0usize..64,
        flip in 1u8..=255
    ) {
        let sig = sign(&key, &message);
        let mut bytes = *sig.as_bytes();
        bytes[index] ^= flip;
        prop_assert!(!verify(&key.public_key(), &message, &Signature::from_bytes(bytes)));
    }

    #[test]
    fn test_other_public_key_rejected(
        key in arb_private_key(),
        other in arb_private_key(),
        message in any::<Vec<u8>>()
    ) {
        prop_assume!(key.as_bytes() != other.as_bytes());
        let sig = sign(&key, &message);
        prop_assert!(!verify(&other.public_key(), &message, &sig));
    }

    #[test]
    fn test_verify_never_panics_on_arbitrary_key(
        key_bytes in any::<[u8; 32]>(),
        sig_bytes in any::<[u8; 32]>(),
        message in any::<Vec<u8>>()
    ) {
        let mut full = [0u8; 64];
        full[..32].copy_from_slice(&sig_bytes);
        let _ = verify(&PublicKey::from_bytes(key_bytes), &message, &Signature::from_bytes(full));
    }
}
