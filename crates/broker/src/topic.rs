//! Topic-exchange routing key matching.

/// `true` if `routing_key` matches the binding `pattern`.
///
/// Both are dot-separated words. In the pattern, `*` matches exactly one word
/// and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn matches(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
    }
}
