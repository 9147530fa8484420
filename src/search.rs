use crate::index::ModRecord;

/// True when every character of `query` appears in `target`, in order,
/// ignoring case. Whitespace in the query is ignored.
pub fn subsequence_match(query: &str, target: &str) -> bool {
    let mut haystack = target.chars().flat_map(char::to_lowercase);
    query
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_lowercase)
        .all(|needle| haystack.any(|ch| ch == needle))
}

pub fn record_matches(query: &str, record: &ModRecord) -> bool {
    if query.trim().is_empty() {
        return true;
    }
    subsequence_match(query, &record.meta.title)
        || record
            .meta
            .categories
            .iter()
            .any(|category| subsequence_match(query, category))
}
