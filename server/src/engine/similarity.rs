/// Levenshtein distance over chars, normalized by the longer length.
///
/// Returns 0.0 for identical strings and 1.0 for completely different ones.
/// Two empty strings are identical.
pub fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }
    edit_distance(&a, &b) as f64 / longest as f64
}

fn edit_distance(a: &[char], b: &[char]) -> usize {
    // Single rolling row.
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            let cost = usize::from(ca != cb);
            row[j + 1] = (above + 1).min(row[j] + 1).min(diagonal + cost);
            diagonal = above;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical() {
        assert_eq!(normalized_edit_distance("hello", "hello"), 0.0);
        assert_eq!(normalized_edit_distance("", ""), 0.0);
    }

    #[test]
    fn test_completely_different() {
        assert_eq!(normalized_edit_distance("abc", "xyz"), 1.0);
        assert_eq!(normalized_edit_distance("", "abcd"), 1.0);
    }

    #[test]
    fn test_known_distances() {
        // kitten -> sitting is the textbook 3 edits over 7 chars
        let d = normalized_edit_distance("kitten", "sitting");
        assert!((d - 3.0 / 7.0).abs() < 1e-9);
        let d = normalized_edit_distance("spam 1", "spam 2");
        assert!((d - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        assert_eq!(normalized_edit_distance("héllo", "hello"), 0.2);
    }
}
