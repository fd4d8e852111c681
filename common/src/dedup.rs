// Canonicalization for duplicate detection

use crate::models::ScrapedJob;
use sha2::{Digest, Sha256};

/// Case-fold and collapse runs of whitespace
pub fn normalize(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized `(title, company)` key shared by the same posting across sources
pub fn canonical_key(title: &str, company: &str) -> String {
    format!("{}|{}", normalize(title), normalize(company))
}

/// Content hash over the normalized description and salary bounds.
///
/// Returns `None` when there is no description: an empty-content hash would
/// collide across every posting that lacks one.
pub fn fingerprint(description: &str, salary_min: Option<i64>, salary_max: Option<i64>) -> Option<String> {
    let description = normalize(description);
    if description.is_empty() {
        return None;
    }

    let bound = |b: Option<i64>| b.map(|v| v.to_string()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(bound(salary_min).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(bound(salary_max).as_bytes());
    Some(hex::encode(hasher.finalize()))
}

/// Canonical key and fingerprint for a scraped posting
pub fn canonicalize(job: &ScrapedJob) -> (String, Option<String>) {
    (
        canonical_key(&job.title, &job.company),
        fingerprint(&job.description, job.salary_min, job.salary_max),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_folds_case_and_whitespace() {
        assert_eq!(normalize("  Senior   Rust\tEngineer \n"), "senior rust engineer");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_canonical_key_ignores_formatting() {
        assert_eq!(
            canonical_key("Engineer", "Acme"),
            canonical_key("  ENGINEER ", "acme")
        );
        assert_ne!(canonical_key("Engineer", "Acme"), canonical_key("Engineer", "Globex"));
    }

    #[test]
    fn test_fingerprint_depends_on_salary() {
        let a = fingerprint("Build things", Some(100), Some(200));
        let b = fingerprint("build   THINGS", Some(100), Some(200));
        let c = fingerprint("Build things", Some(100), Some(250));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_absent_without_description() {
        assert_eq!(fingerprint("   ", Some(1), Some(2)), None);
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(s in "[a-zA-Z0-9 \\t]{0,40}") {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn prop_canonical_key_stable_under_padding(title in "[a-zA-Z ]{1,20}", company in "[a-zA-Z ]{0,20}") {
            let padded = canonical_key(&format!("  {}  ", title.to_uppercase()), &format!("\t{}", company));
            prop_assert_eq!(padded, canonical_key(&title, &company));
        }
    }
}
