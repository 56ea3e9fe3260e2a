/// Evaluates whether a subscription's topic entries match a topic name.
///
/// In prefix mode an empty entry matches every topic, except that
/// `$`-prefixed meta topics only match entries that themselves start with
/// `$`. This keeps empty-prefix subscribers from accidentally pulling in
/// the reflective topics.
pub fn subscription_matches(entries: &[String], prefix: bool, topic_name: &str) -> bool {
    for entry in entries {
        if prefix {
            if topic_name.starts_with('$') {
                if entry.starts_with('$') && topic_name.starts_with(entry.as_str()) {
                    return true;
                }
            } else if entry.is_empty() || topic_name.starts_with(entry.as_str()) {
                return true;
            }
        } else if topic_name == entry {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn exact_match() {
        assert!(subscription_matches(&entries(&["/t"]), false, "/t"));
        assert!(!subscription_matches(&entries(&["/t"]), false, "/t2"));
        assert!(!subscription_matches(&entries(&["/t"]), false, "/"));
        assert!(!subscription_matches(&entries(&[]), false, "/t"));
    }

    #[test]
    fn prefix_match() {
        assert!(subscription_matches(&entries(&["/a"]), true, "/a/b"));
        assert!(subscription_matches(&entries(&["/a"]), true, "/a"));
        assert!(!subscription_matches(&entries(&["/a/b"]), true, "/a"));
    }

    #[test]
    fn empty_prefix_matches_everything_but_meta() {
        assert!(subscription_matches(&entries(&[""]), true, "/t"));
        assert!(subscription_matches(&entries(&[""]), true, "anything"));
        assert!(!subscription_matches(&entries(&[""]), true, "$clients"));
        assert!(!subscription_matches(&entries(&[""]), true, "$sub$/t"));
    }

    #[test]
    fn meta_requires_dollar_entry() {
        assert!(subscription_matches(&entries(&["$"]), true, "$clients"));
        assert!(subscription_matches(&entries(&["$clients"]), true, "$clients"));
        assert!(!subscription_matches(&entries(&["clients"]), true, "$clients"));
        // exact mode has no gating
        assert!(subscription_matches(
            &entries(&["$clients"]),
            false,
            "$clients"
        ));
    }

    #[test]
    fn empty_entry_is_not_a_wildcard_in_exact_mode() {
        assert!(!subscription_matches(&entries(&[""]), false, "/t"));
        assert!(subscription_matches(&entries(&[""]), false, ""));
    }
}
