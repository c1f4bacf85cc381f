//! Result reducer determinism across input orderings.

use riskcoord_core::{merge_classifications, Classification};

fn finding(id: &str, article: Option<&str>, risk_type: &str, reason: &str) -> Classification {
    Classification {
        id: id.to_string(),
        text: format!("clause {id}"),
        risk_type: risk_type.to_string(),
        reason: reason.to_string(),
        article_info: article.map(String::from),
        ..Default::default()
    }
}

fn default_pass() -> Vec<Classification> {
    vec![
        finding("d1", Some("第12条"), "1", "penalty clause"),
        finding("d2", Some("第3条第2項"), "4", "auto renewal"),
        finding("d3", Some("第3条第1項"), "4", "auto renewal without notice period"),
        finding("d4", None, "9", "governing law unclear"),
    ]
}

fn custom_pass() -> Vec<Classification> {
    vec![
        finding("c1", Some("第12条"), "1", "penalty clause exceeding actual damages"),
        finding("c2", Some("第3条第2項"), "4", "auto renew"),
        finding("c3", Some("Article 7"), "2", "exclusive dealing"),
        finding("c4", Some("第12条"), "5", "non-compete"),
    ]
}

#[test]
fn test_same_output_for_any_pass_order() {
    let forward = merge_classifications(vec![default_pass(), custom_pass()]);
    let backward = merge_classifications(vec![custom_pass(), default_pass()]);
    assert_eq!(forward, backward);
}

#[test]
fn test_same_output_when_findings_are_shuffled() {
    let mut a = default_pass();
    a.reverse();
    let mut b = custom_pass();
    b.rotate_left(2);

    let shuffled = merge_classifications(vec![b, a]);
    let straight = merge_classifications(vec![default_pass(), custom_pass()]);
    assert_eq!(shuffled, straight);
}

#[test]
fn test_merged_content_and_order() {
    let merged = merge_classifications(vec![default_pass(), custom_pass()]);
    let ids: Vec<&str> = merged.iter().map(|c| c.id.as_str()).collect();

    // 第3条第1項, 第3条第2項 (longer reason from the default pass), Article 7,
    // 第12条 type 1 (custom, longer), 第12条 type 5, then the unreferenced one.
    assert_eq!(ids, vec!["d3", "d2", "c3", "c1", "c4", "d4"]);
}

#[test]
fn test_single_pass_is_only_sorted() {
    let merged = merge_classifications(vec![default_pass()]);
    assert_eq!(merged.len(), 4);
    assert_eq!(merged.last().map(|c| c.id.as_str()), Some("d4"));
}
