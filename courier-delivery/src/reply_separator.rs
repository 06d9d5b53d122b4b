//! Splits a plain-text reply into new content and quoted history.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Quoted-reply markers, most specific first. Each one swallows everything
/// after it.
const RULES: &[&str] = &[
    r"(?ms)^-{2,10} $.*",
    r"(?ms)^>*\s*----- ?Original Message ?-----.*",
    r"(?ms)^>*\s*From:[^\r\n]*[\r\n]+Sent:.*",
    r"(?ms)^>*\s*From:[^\r\n]*[\r\n]+Date:.*",
    r"(?ms)^>*\s*-----Urspr.ngliche Nachricht----- .*",
    r"(?m)^>*\s*Le[^\r\n]{10,200}a .crit ?:\s*$.*",
    r"(?ms)^>*\s*__________________.*",
    r"(?ms)^>*\s*On.{10,200}wrote:\s*$.*",
    r"(?ms)^>*\s*Sent from my.*",
    r"(?ms)^>*\s*=== Please reply above this line ===.*",
    r"(?m)(^>.*\n?){10,}",
];

static COMPILED_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|rule| Regex::new(rule).ok())
        .collect()
});

/// Returns the new content and, if anything was removed, the quoted history.
///
/// Carriage returns are dropped first. Removed fragments are accumulated with
/// the most recently removed first.
#[must_use]
pub fn separate(text: &str) -> (String, Option<String>) {
    let mut text = text.replace('\r', "");
    let mut stripped = String::new();

    for rule in COMPILED_RULES.iter() {
        text = rule
            .replace_all(&text, |captures: &Captures<'_>| {
                stripped = format!("{}\n{stripped}", &captures[0]);
                ""
            })
            .into_owned();
    }

    let stripped = stripped.trim();
    (
        text.trim().to_string(),
        (!stripped.is_empty()).then(|| stripped.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(COMPILED_RULES.len(), RULES.len());
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let (text, stripped) = separate("Thanks, see you tomorrow.\r\n");
        assert_eq!(text, "Thanks, see you tomorrow.");
        assert_eq!(stripped, None);
    }

    #[test]
    fn test_signature_is_stripped() {
        let (text, stripped) =
            separate("Sounds good.\n\n-- \nAlice Example\nHead of Things\n");
        assert_eq!(text, "Sounds good.");
        assert_eq!(stripped.as_deref(), Some("-- \nAlice Example\nHead of Things"));
    }

    #[test]
    fn test_on_wrote_quote() {
        let body = "Yes please.\n\nOn Thu, 15 Oct 2026 at 10:00, Bob <bob@example.net> wrote:\n> Shall I book it?\n";
        let (text, stripped) = separate(body);
        assert_eq!(text, "Yes please.");
        assert!(stripped.unwrap().starts_with("On Thu, 15 Oct 2026"));
    }

    #[test]
    fn test_outlook_header_block() {
        let body = "Done.\n\nFrom: Bob\nSent: Thursday\nTo: Alice\nSubject: Task\n";
        let (text, stripped) = separate(body);
        assert_eq!(text, "Done.");
        assert!(stripped.unwrap().contains("Subject: Task"));
    }

    #[test]
    fn test_later_rules_prepend_history() {
        let body = "Reply\nSent from my phone\n\n-- \nsig\n";
        let (text, stripped) = separate(body);
        assert_eq!(text, "Reply");
        assert_eq!(stripped.as_deref(), Some("Sent from my phone\n\n\n-- \nsig"));
    }

    #[test]
    fn test_long_quote_block() {
        let quoted: String = (0..10).map(|i| format!("> line {i}\n")).collect();
        let (text, stripped) = separate(&format!("Agreed.\n{quoted}"));
        assert_eq!(text, "Agreed.");
        assert!(stripped.unwrap().starts_with("> line 0"));
    }
}
