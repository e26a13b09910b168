//! Variant assigner — deterministic recipient → variant mapping for
//! A/B/C testing.
//!
//! No randomness and no external state: the same recipient id always
//! lands on the same variant, across retries and process restarts, so a
//! recipient can never receive two renderings of the same step.

use evermail_core::types::MessageVariant;

/// Stable mix of the id bytes. Multiply-and-add keeps the distribution
/// roughly uniform even for ids sharing a common prefix.
fn stable_hash(recipient_id: &str) -> u64 {
    recipient_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)))
}

/// Pick the variant for a recipient. Returns None only for an empty
/// variant list.
pub fn assign<'a>(recipient_id: &str, variants: &'a [MessageVariant]) -> Option<&'a MessageVariant> {
    if variants.is_empty() {
        return None;
    }
    let index = (stable_hash(recipient_id) % variants.len() as u64) as usize;
    Some(&variants[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants(n: usize) -> Vec<MessageVariant> {
        (0..n)
            .map(|i| MessageVariant {
                label: char::from(b'A' + i as u8).to_string(),
                subject: format!("Subject {i}"),
                html_body: "<p>{{ name }}</p>".into(),
                text_body: None,
            })
            .collect()
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let vs = variants(3);
        let first = assign("biz-0042", &vs).unwrap().label.clone();
        for _ in 0..50 {
            assert_eq!(assign("biz-0042", &vs).unwrap().label, first);
        }
    }

    #[test]
    fn test_empty_variant_list() {
        assert!(assign("biz-0042", &[]).is_none());
    }

    #[test]
    fn test_single_variant_always_selected() {
        let vs = variants(1);
        assert_eq!(assign("anyone", &vs).unwrap().label, "A");
    }

    #[test]
    fn test_distribution_is_roughly_uniform() {
        let vs = variants(2);
        let mut counts = [0usize; 2];
        for i in 0..1000 {
            let v = assign(&format!("biz-{i:04}"), &vs).unwrap();
            counts[(v.label.as_bytes()[0] - b'A') as usize] += 1;
        }
        // Not statistically perfect, but nowhere near degenerate.
        assert!(counts[0] > 300, "skewed split: {counts:?}");
        assert!(counts[1] > 300, "skewed split: {counts:?}");
    }
}
