//! Merging classification results from several passes.
//!
//! A default pass and any number of custom-criteria passes can report the
//! same risk for the same article. One finding survives per
//! `(articleInfo, type)`, the one with the more detailed reason, and the
//! result is ordered by document position.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::article::parse_article_ref;
use crate::models::Classification;

/// Composite identity of a finding: (document position reference, category).
pub fn dedup_key(c: &Classification) -> (String, String) {
    (
        c.article_info.as_deref().unwrap_or("").trim().to_string(),
        c.risk_type.trim().to_string(),
    )
}

/// Deduplicate and order findings from any number of passes.
///
/// The output depends only on the multiset of inputs, never on the order
/// of passes or of findings within a pass.
pub fn merge_classifications<I>(passes: I) -> Vec<Classification>
where
    I: IntoIterator<Item = Vec<Classification>>,
{
    let mut unique: HashMap<(String, String), Classification> = HashMap::new();

    for classification in passes.into_iter().flatten() {
        let key = dedup_key(&classification);
        match unique.get(&key) {
            Some(existing) if !prefer(&classification, existing) => {}
            _ => {
                unique.insert(key, classification);
            }
        }
    }

    let mut merged: Vec<Classification> = unique.into_values().collect();
    sort_by_article(&mut merged);
    merged
}

/// Sort findings ascending by document position, unparseable references last.
pub fn sort_by_article(items: &mut [Classification]) {
    items.sort_by(|a, b| {
        parse_article_ref(a.article_info.as_deref())
            .cmp(&parse_article_ref(b.article_info.as_deref()))
            .then_with(|| a.article_info.cmp(&b.article_info))
            .then_with(|| a.risk_type.cmp(&b.risk_type))
            .then_with(|| field_order(a, b))
    });
}

/// Total order over every remaining field, so equal-keyed findings never
/// fall back to input order.
fn field_order(a: &Classification, b: &Classification) -> Ordering {
    a.reason
        .cmp(&b.reason)
        .then_with(|| a.text.cmp(&b.text))
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.page_number.cmp(&b.page_number))
        .then_with(|| a.position.start.cmp(&b.position.start))
        .then_with(|| a.position.end.cmp(&b.position.end))
        .then_with(|| a.article_title.cmp(&b.article_title))
        .then_with(|| a.article_overview.cmp(&b.article_overview))
        .then_with(|| a.specific_clause.cmp(&b.specific_clause))
        .then_with(|| a.article_info.cmp(&b.article_info))
        .then_with(|| a.risk_type.cmp(&b.risk_type))
}

/// Whether `candidate` should replace `current` for the same key.
fn prefer(candidate: &Classification, current: &Classification) -> bool {
    let by_detail = candidate
        .reason
        .chars()
        .count()
        .cmp(&current.reason.chars().count());
    match by_detail {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => field_order(candidate, current) == Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(article: &str, risk_type: &str, reason: &str) -> Classification {
        Classification {
            id: format!("{article}-{risk_type}-{}", reason.len()),
            text: format!("text of {article}"),
            risk_type: risk_type.to_string(),
            reason: reason.to_string(),
            article_info: Some(article.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_collision_keeps_longer_reason() {
        let default_pass = vec![finding("第9条", "3", "short")];
        let custom_pass = vec![finding("第9条", "3", "a much more detailed reason")];

        let merged = merge_classifications(vec![default_pass, custom_pass]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].reason, "a much more detailed reason");
    }

    #[test]
    fn test_distinct_categories_survive() {
        let merged = merge_classifications(vec![vec![
            finding("第9条", "3", "x"),
            finding("第9条", "4", "y"),
        ]]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_order_by_article_then_subsection() {
        let merged = merge_classifications(vec![vec![
            finding("第10条", "1", "a"),
            finding("第2条第3項", "1", "b"),
            finding("第2条第1項", "1", "c"),
            finding("付則", "1", "d"),
        ]]);
        let order: Vec<_> = merged
            .iter()
            .map(|c| c.article_info.clone().unwrap())
            .collect();
        assert_eq!(order, vec!["第2条第1項", "第2条第3項", "第10条", "付則"]);
    }

    #[test]
    fn test_missing_article_info_sorts_last() {
        let mut no_ref = finding("", "9", "r");
        no_ref.article_info = None;
        let merged = merge_classifications(vec![vec![no_ref, finding("第1条", "9", "r")]]);
        assert_eq!(merged[0].article_info.as_deref(), Some("第1条"));
        assert!(merged[1].article_info.is_none());
    }

    #[test]
    fn test_equal_length_tie_is_order_independent() {
        let a = finding("第5条", "2", "abc");
        let b = finding("第5条", "2", "abd");

        let ab = merge_classifications(vec![vec![a.clone()], vec![b.clone()]]);
        let ba = merge_classifications(vec![vec![b], vec![a]]);
        assert_eq!(ab, ba);
        assert_eq!(ab[0].reason, "abc");
    }

    #[test]
    fn test_tie_on_text_falls_through_to_location() {
        let mut a = finding("第5条", "2", "abc");
        a.page_number = 3;
        let mut b = a.clone();
        b.page_number = 1;
        let mut c = a.clone();
        c.page_number = 1;
        c.position.start = 40;
        c.position.end = 52;

        let forward = merge_classifications(vec![vec![a.clone(), b.clone(), c.clone()]]);
        let backward = merge_classifications(vec![vec![c], vec![b], vec![a]]);
        assert_eq!(forward, backward);
        assert_eq!(forward[0].page_number, 1);
        assert_eq!(forward[0].position.start, 0);
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_classifications(Vec::<Vec<Classification>>::new()).is_empty());
    }
}
