//! Document-position references (`第9条第1項第2号`, `Article 9, paragraph 1`).
//!
//! Findings are ordered by the article number, then paragraph, then item
//! parsed out of a free-form reference string. References with no article
//! number sort after every parseable one.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

static JA_ARTICLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"第\s*(\d+)\s*条").unwrap());
static JA_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"第\s*(\d+)\s*項").unwrap());
static JA_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"第\s*(\d+)\s*号").unwrap());

static EN_ARTICLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:article|art\.|section|sec\.|clause)\s*(\d+)").unwrap()
});
static EN_PARAGRAPH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:paragraph|para\.)\s*(\d+)").unwrap());
static EN_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bitem\s*(\d+)").unwrap());

/// Parsed position of a finding within a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArticleRef {
    /// `None` when no article number could be found.
    pub article: Option<u32>,
    pub paragraph: u32,
    pub item: u32,
}

impl ArticleRef {
    pub const UNPARSEABLE: ArticleRef = ArticleRef {
        article: None,
        paragraph: 0,
        item: 0,
    };

    pub fn is_parseable(&self) -> bool {
        self.article.is_some()
    }
}

impl Ord for ArticleRef {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.article, other.article) {
            (Some(a), Some(b)) => a
                .cmp(&b)
                .then(self.paragraph.cmp(&other.paragraph))
                .then(self.item.cmp(&other.item)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for ArticleRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parse a structured reference string. Missing paragraph/item default to 0.
pub fn parse_article_ref(info: Option<&str>) -> ArticleRef {
    let Some(info) = info.map(str::trim).filter(|s| !s.is_empty()) else {
        return ArticleRef::UNPARSEABLE;
    };

    let article = capture_number(&JA_ARTICLE, info).or_else(|| capture_number(&EN_ARTICLE, info));
    if article.is_none() {
        return ArticleRef::UNPARSEABLE;
    }

    let paragraph = capture_number(&JA_PARAGRAPH, info)
        .or_else(|| capture_number(&EN_PARAGRAPH, info))
        .unwrap_or(0);
    let item = capture_number(&JA_ITEM, info)
        .or_else(|| capture_number(&EN_ITEM, info))
        .unwrap_or(0);

    ArticleRef {
        article,
        paragraph,
        item,
    }
}

/// Compare two optional reference strings by document position.
pub fn compare_article_info(a: Option<&str>, b: Option<&str>) -> Ordering {
    parse_article_ref(a).cmp(&parse_article_ref(b))
}

fn capture_number(re: &Regex, haystack: &str) -> Option<u32> {
    let digits = re.captures(haystack)?.get(1)?.as_str();
    parse_digits(digits)
}

// `\d` is Unicode-aware, so full-width digits (`第１２条`) reach here too.
fn parse_digits(digits: &str) -> Option<u32> {
    let ascii: String = digits
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            _ => c,
        })
        .collect();
    ascii.parse().ok()
}
