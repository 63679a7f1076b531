use std::cmp::Ordering;

/// Total order on paths used by the metadata index: shorter depth first,
/// then segment-wise lexicographic (§4.8, §9 Open Question 2). A plain
/// `Vec<String>` comparison is not equivalent: two vectors where neither is
/// a prefix of the other compare by their first differing element
/// regardless of length, which would interleave a depth-1 path with a
/// depth-2 path whose first segment sorts earlier.
pub fn bfs_cmp(a: &[String], b: &[String]) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        other => other,
    }
}

pub fn bfs_lt(a: &[String], b: &[String]) -> bool {
    bfs_cmp(a, b) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(path: &str) -> Vec<String> {
        path.split('/').map(String::from).collect()
    }

    #[test]
    fn test_depth_dominates_lexicographic_order() {
        // "b" (depth 1) sorts before "a/z" (depth 2) even though 'a' < 'b'.
        assert!(bfs_lt(&segs("b"), &segs("a/z")));
    }

    #[test]
    fn test_same_depth_is_lexicographic() {
        assert!(bfs_lt(&segs("a/b"), &segs("a/d")));
        assert!(!bfs_lt(&segs("a/d"), &segs("a/b")));
    }

    #[test]
    fn test_equal_paths_are_not_less() {
        assert!(!bfs_lt(&segs("a/b"), &segs("a/b")));
    }
}
