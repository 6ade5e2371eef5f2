/// Keywords that address every member of a room.
const ALL_KEYWORDS: [&str; 3] = ["all", "everyone", "所有人"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    /// Member ids in the order they were first mentioned.
    pub ids: Vec<String>,
    pub all: bool,
}

impl Mentions {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && !self.all
    }
}

/// Finds `@Name` and `@all` mentions. `members` pairs ids with display names;
/// when names overlap the longest one wins, compared case-insensitively.
pub fn parse_mentions(text: &str, members: &[(String, String)]) -> Mentions {
    let mut mentions = Mentions::default();
    let mut by_length: Vec<&(String, String)> =
        members.iter().filter(|(_, name)| !name.trim().is_empty()).collect();
    by_length.sort_by(|a, b| b.1.chars().count().cmp(&a.1.chars().count()));

    for (index, _) in text.match_indices('@') {
        let rest = &text[index + 1..];
        let lowered = rest.to_lowercase();

        if ALL_KEYWORDS
            .iter()
            .any(|keyword| starts_with_word(&lowered, keyword))
        {
            mentions.all = true;
            continue;
        }

        let matched = by_length
            .iter()
            .find(|(_, name)| starts_with_word(&lowered, &name.to_lowercase()));
        if let Some((id, _)) = matched {
            if !mentions.ids.contains(id) {
                mentions.ids.push(id.clone());
            }
        }
    }

    mentions
}

fn starts_with_word(text: &str, word: &str) -> bool {
    if !text.starts_with(word) {
        return false;
    }
    // "@Mika" must not match inside "@Mikael"
    match text[word.len()..].chars().next() {
        Some(next) => !next.is_alphanumeric() || !word.is_ascii(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<(String, String)> {
        vec![
            ("c1".to_string(), "Mika".to_string()),
            ("c2".to_string(), "Mika Chan".to_string()),
            ("c3".to_string(), "Ren".to_string()),
        ]
    }

    #[test]
    fn mentions_keep_order_and_dedupe() {
        let parsed = parse_mentions("@ren what do you think, @mika? @Ren!", &members());
        assert_eq!(parsed.ids, vec!["c3".to_string(), "c1".to_string()]);
        assert!(!parsed.all);
    }

    #[test]
    fn longest_name_wins() {
        let parsed = parse_mentions("hey @Mika Chan", &members());
        assert_eq!(parsed.ids, vec!["c2".to_string()]);
    }

    #[test]
    fn all_keywords_set_the_flag() {
        assert!(parse_mentions("@all dinner?", &members()).all);
        assert!(parse_mentions("@Everyone look", &members()).all);
        assert!(parse_mentions("@所有人 看这里", &members()).all);
        assert!(!parse_mentions("@allison hi", &members()).all);
    }

    #[test]
    fn unknown_or_partial_names_are_ignored() {
        let parsed = parse_mentions("mail me at x@example.com, @Mikael", &members());
        assert!(parsed.is_empty());
    }
}
