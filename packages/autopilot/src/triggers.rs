//! Trigger phrases that make the responder answer right away.

/// Phrases that mark a prompt asking the user to pick an option.
///
/// Heuristic: these over- and under-match real prompts, `"1)"` in particular
/// fires on any numbered list.
pub const DEFAULT_TRIGGERS: &[&str] = &[
    "do you want to proceed",
    "continue?",
    "press 1",
    "1)",
    "choose an option",
];

/// Ordered, case-insensitive substrings checked against each output line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerSet {
    // Lowercased; empty phrases are dropped since they would match every line.
    phrases: Vec<String>,
}

impl Default for TriggerSet {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGERS.iter().copied())
    }
}

impl TriggerSet {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// First phrase contained in `line`, if any.
    pub fn find(&self, line: &str) -> Option<&str> {
        let line = line.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| line.contains(phrase.as_str()))
            .map(String::as_str)
    }

    pub fn matches(&self, line: &str) -> bool {
        self.find(line).is_some()
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phrases_in_order() {
        let triggers = TriggerSet::default();
        assert_eq!(triggers.phrases().len(), 5);
        assert_eq!(triggers.phrases()[0], "do you want to proceed");
        assert_eq!(triggers.phrases()[4], "choose an option");
    }

    #[test]
    fn case_insensitive() {
        let triggers = TriggerSet::default();
        assert_eq!(
            triggers.find("Do You Want To PROCEED with this edit?"),
            Some("do you want to proceed")
        );
        assert!(triggers.matches("PRESS 1 to continue"));
        assert!(triggers.matches("Please Choose An Option:"));
    }

    #[test]
    fn first_match_wins() {
        let triggers = TriggerSet::default();
        // Contains both "continue?" and "1)"
        assert_eq!(triggers.find("Continue? (1) yes (2) no"), Some("continue?"));
    }

    #[test]
    fn no_match() {
        let triggers = TriggerSet::default();
        assert!(!triggers.matches("Reading src/main.rs"));
        assert!(!triggers.matches(""));
        assert!(!triggers.matches("continue"));
    }

    #[test]
    fn custom_phrases_lowercased_and_empty_dropped() {
        let triggers = TriggerSet::new(["Approve?", "", "Y/N"]);
        assert_eq!(triggers.phrases(), &["approve?".to_string(), "y/n".to_string()]);
        assert!(triggers.matches("approve? [y/n]"));
        assert!(!triggers.matches("anything else"));
    }

    #[test]
    fn empty_set_never_matches() {
        let triggers = TriggerSet::new(Vec::<String>::new());
        assert!(triggers.is_empty());
        assert!(!triggers.matches("do you want to proceed"));
    }
}
