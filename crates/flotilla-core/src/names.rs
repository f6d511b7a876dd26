//! Deterministic, length-bounded identifier helpers.
//!
//! Kubernetes object names are capped at 63 characters (RFC 1123 label) and
//! helm release names at 53. Everything in here shortens by hashing, never by
//! counting, so two controllers computing the same name independently always
//! agree.

use std::sync::LazyLock;

use md5::{Digest as _, Md5};
use regex::Regex;
use sha2::Sha256;

/// Maximum length of a generated Kubernetes object name.
const MAX_OBJECT_NAME_LENGTH: usize = 63;

/// Maximum length of a helm release name. Helm reserves room for the
/// `sh.helm.release.v1.<name>.v<rev>` storage key inside a 63-char label.
pub const MAX_RELEASE_NAME_LENGTH: usize = 53;

const RELEASE_NAME_FMT: &str =
    "^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

static RELEASE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(RELEASE_NAME_FMT).expect("failed to compile release name regex")
});

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn md5_hex(input: &str, length: usize) -> String {
    let digest = hex::encode(Md5::digest(input.as_bytes()));
    digest[..length.min(digest.len())].to_string()
}

/// Joins the given parts with `-` and shortens the result to a valid object
/// name, appending a digest of the full input when truncation was needed.
///
/// The truncation point is chosen so the character before the digest is
/// alphanumeric, which keeps the result a valid RFC 1123 label without ever
/// producing `--`.
pub fn safe_concat_name<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let full: Vec<String> = parts
        .into_iter()
        .map(|part| part.as_ref().to_string())
        .filter(|part| !part.is_empty())
        .collect();
    let full = full.join("-");

    if full.len() < MAX_OBJECT_NAME_LENGTH + 1 {
        return full;
    }

    let digest = sha256_hex(&full);
    let boundary = full.as_bytes()[56];
    if boundary.is_ascii_lowercase() || boundary.is_ascii_digit() {
        format!("{}-{}", &full[..57], &digest[..5])
    } else {
        format!("{}-{}", &full[..56], &digest[..6])
    }
}

/// Shortens `s` to at most `count` characters, replacing the removed tail
/// with a 5-character digest of the full input.
pub fn limit(s: &str, count: usize) -> String {
    if s.len() <= count {
        return s.to_string();
    }

    const HASH_LENGTH: usize = 5;
    if count <= HASH_LENGTH + 1 {
        return s[..count].to_string();
    }

    let mut kept = &s[..count - HASH_LENGTH - 1];
    if kept.ends_with('-') {
        kept = &kept[..kept.len() - 1];
    }
    format!("{kept}-{}", md5_hex(s, HASH_LENGTH))
}

/// Derives a DNS-safe helm release name from an arbitrary identifier.
///
/// Inputs that already carry case or punctuation get a digest suffix before
/// sanitizing so distinct inputs cannot collapse onto the same release.
pub fn helm_release_name(input: &str) -> String {
    let mut name = input.to_string();
    let needs_suffix = name != name.to_lowercase()
        || name
            .chars()
            .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.'));
    if needs_suffix {
        name = format!("{name}-{}", md5_hex(input, 8));
    }

    let mut sanitized = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' {
            c
        } else {
            '-'
        };
        if c == '-' {
            if last_was_dash {
                continue;
            }
            last_was_dash = true;
        } else {
            last_was_dash = false;
        }
        sanitized.push(c);
    }
    let sanitized = sanitized.trim_matches('-');
    let sanitized = limit(sanitized, MAX_RELEASE_NAME_LENGTH);

    if RELEASE_NAME_REGEX.is_match(&sanitized) {
        sanitized
    } else {
        md5_hex(input, 24)
    }
}

/// First six hex characters of the SHA-256 of `s`. Used purely to break ties
/// in derived identifiers.
pub fn key_hash(s: &str) -> String {
    sha256_hex(s)[..6].to_string()
}

/// The namespace on the manager cluster that holds a downstream cluster's
/// BundleDeployments. Unique per `(namespace, name)` and at most 63 chars.
pub fn cluster_namespace(namespace: &str, name: &str) -> String {
    let suffix = key_hash(&format!("{namespace}::{name}"));
    safe_concat_name(["cluster", namespace, name, suffix.as_str()])
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn is_valid_object_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= MAX_OBJECT_NAME_LENGTH
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-')
    }

    #[test]
    fn short_names_pass_through() {
        assert_eq!(safe_concat_name(["a", "b", "c"]), "a-b-c");
        assert_eq!(safe_concat_name(["only"]), "only");
    }

    #[test]
    fn empty_parts_are_skipped() {
        assert_eq!(safe_concat_name(["a", "", "b"]), "a-b");
    }

    #[test]
    fn long_names_are_shortened_to_63() {
        let name = safe_concat_name([&"x".repeat(80)]);
        assert_eq!(name.len(), 63);
        assert!(is_valid_object_name(&name));
    }

    #[test]
    fn boundary_dash_takes_longer_digest() {
        // 56 chars then a dash, so the cut at 57 would end on `-`.
        let input = format!("{}-{}", "a".repeat(56), "b".repeat(20));
        let name = safe_concat_name([&input]);
        assert_eq!(name.len(), 63);
        assert!(!name.contains("--"));
        assert!(name.starts_with(&"a".repeat(56)));
    }

    #[test]
    fn concat_is_deterministic() {
        let long_name = "n".repeat(100);
        let long_part = "p".repeat(64);
        let cases: [&[&str]; 3] = [
            &["bundle", "my-app", "production"],
            &["cluster", "fleet-default", long_name.as_str()],
            &[long_part.as_str()],
        ];

        for parts in cases {
            let a = safe_concat_name(parts.iter().copied());
            let b = safe_concat_name(parts.iter().copied());
            assert_eq!(a, b);
            assert!(is_valid_object_name(&a));
        }
    }

    #[test]
    fn limit_returns_short_strings_unchanged() {
        assert_eq!(limit("short", 10), "short");
        assert_eq!(limit("exact", 5), "exact");
    }

    #[test]
    fn limit_truncates_tiny_budgets_without_digest() {
        assert_eq!(limit("abcdefghij", 4), "abcd");
        assert_eq!(limit("abcdefghij", 6), "abcdef");
    }

    #[test]
    fn limit_appends_digest() {
        let out = limit("abcdefghijklmnop", 12);
        assert_eq!(out.len(), 12);
        assert!(out.starts_with("abcdef-"));
    }

    #[test]
    fn limit_drops_trailing_dash_before_digest() {
        // Cut position lands directly after the dash.
        let out = limit("abcdef-hijklmnop", 13);
        assert!(!out.contains("--"));
        assert!(out.starts_with("abcdef-"));
        assert_eq!(out.len(), 12);
    }

    #[rstest]
    #[case("simple")]
    #[case("with-dashes-already")]
    #[case("dotted.name.ok")]
    fn release_name_keeps_clean_inputs(#[case] input: &str) {
        assert_eq!(helm_release_name(input), input);
    }

    #[test]
    fn release_name_hashes_uppercase_inputs() {
        let out = helm_release_name("MyApp");
        assert_ne!(out, "myapp");
        assert!(out.starts_with("myapp-"));
        assert!(RELEASE_NAME_REGEX.is_match(&out));
    }

    #[test]
    fn release_name_collapses_punctuation() {
        let out = helm_release_name("my_app//v2");
        assert!(RELEASE_NAME_REGEX.is_match(&out));
        assert!(!out.contains("--"));
    }

    #[test]
    fn release_name_is_bounded() {
        let out = helm_release_name(&"a".repeat(100));
        assert!(out.len() <= MAX_RELEASE_NAME_LENGTH);
        assert!(RELEASE_NAME_REGEX.is_match(&out));
    }

    #[test]
    fn release_name_falls_back_to_digest() {
        // Nothing usable survives sanitizing.
        let out = helm_release_name("---");
        assert_eq!(out.len(), 24);
        assert!(out.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_inputs_get_distinct_release_names() {
        assert_ne!(helm_release_name("My_App"), helm_release_name("my-app"));
    }

    #[test]
    fn key_hash_is_six_hex_chars() {
        let h = key_hash("anything");
        assert_eq!(h.len(), 6);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, key_hash("anything"));
    }

    #[test]
    fn cluster_namespace_shape() {
        let ns = cluster_namespace("fleet-default", "my-cluster");
        assert!(ns.starts_with("cluster-fleet-default-my-cluster-"));
        assert!(ns.len() <= MAX_OBJECT_NAME_LENGTH);
    }

    #[test]
    fn cluster_namespace_disambiguates_ambiguous_joins() {
        // Same joined string, different (namespace, name) split.
        let a = cluster_namespace("a-b", "c");
        let b = cluster_namespace("a", "b-c");
        assert_ne!(a, b);
    }
}
