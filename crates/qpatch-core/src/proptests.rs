//! Property-based tests for qpatch-core.
//!
//! # Properties Tested
//!
//! - Any single changed byte fails the integrity gate
//! - Patch application reconstructs the target exactly
//! - Arbitrary bytes after the magic never panic the patcher
//! - Binding the config document appends the serial and keeps other fields

#![cfg(test)]

use proptest::prelude::*;

use crate::bspatch::{apply_bsdiff, BSDIFF_MAGIC};
use crate::config_doc::ConfigDocument;
use crate::error::PatcherError;
use crate::integrity::{ArtifactVerifier, Sha256Digest, TrustedSet};
use crate::testing::naive_patch;

// =============================================================================
// Generators
// =============================================================================

fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

fn arb_serial() -> impl Strategy<Value = String> {
    "[A-Z0-9]{8,16}"
}

// =============================================================================
// Integrity gate
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_trusted_content_accepted(content in arb_content()) {
        let trusted = TrustedSet::new(vec![Sha256Digest::of(&content)]);
        let result =
            ArtifactVerifier::new().verify_reader("artifact", &mut content.as_slice(), &trusted);
        prop_assert!(result.is_ok(), "Trusted content should pass: {:?}", result.err());
    }

    #[test]
    fn prop_single_byte_change_rejected(
        content in arb_content(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let trusted = TrustedSet::new(vec![Sha256Digest::of(&content)]);
        let mut tampered = content.clone();
        let at = index.index(tampered.len());
        tampered[at] ^= flip;

        let result =
            ArtifactVerifier::new().verify_reader("artifact", &mut tampered.as_slice(), &trusted);
        let is_mismatch = matches!(result, Err(PatcherError::IntegrityMismatch { .. }));
        prop_assert!(is_mismatch, "Tampered content should be rejected");
    }
}

// =============================================================================
// Patch application
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_patch_reconstructs_target(old in arb_content(), new in arb_content()) {
        let patch = naive_patch(&old, &new).unwrap();
        let rebuilt = apply_bsdiff(&old, &patch).unwrap();
        prop_assert_eq!(rebuilt, new);
    }

    #[test]
    fn prop_garbage_after_magic_never_panics(
        old in arb_content(),
        tail in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut patch = BSDIFF_MAGIC.to_vec();
        patch.extend_from_slice(&tail);
        // Either outcome is fine; reaching here means no panic.
        let _ = apply_bsdiff(&old, &patch);
    }
}

// =============================================================================
// Config document binding
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_append_serial(serial in arb_serial()) {
        let mut document = ConfigDocument::parse(
            r#"{"apiservice_host": "http://a", "loginservice_host": "ws://b/login?serial="}"#,
        ).unwrap();
        let value = document.append_to_field("loginservice_host", &serial).unwrap();

        prop_assert_eq!(value.clone(), format!("ws://b/login?serial={serial}"));
        prop_assert_eq!(document.get_str("loginservice_host"), Some(value.as_str()));
        prop_assert_eq!(document.get_str("apiservice_host"), Some("http://a"));
    }
}
