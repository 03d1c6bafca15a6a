pub static DOCUMENT_SUMMARY_SYSTEM_MESSAGE: &str = "You summarise public tender documents for bid teams. \
Write at most five sentences covering what is being procured, key dates and deadlines, \
eligibility or qualification requirements, and evaluation criteria. Use only the supplied text. \
If a topic is not covered, leave it out rather than guessing.";

/// Characters of document text handed to the model for a summary.
pub const SUMMARY_INPUT_CHAR_LIMIT: usize = 12_000;

/// Characters kept by the offline summary.
pub const EXTRACTIVE_SUMMARY_CHARS: usize = 600;

pub fn summary_user_message(title: &str, excerpt: &str) -> String {
    format!("Document title: {title}\n\nDocument text:\n{excerpt}")
}

/// Offline summary: the leading sentences of the document, cut at a sentence boundary when
/// one falls inside the budget.
pub fn extractive_summary(text: &str, max_chars: usize) -> String {
    let head: String = text.chars().take(max_chars).collect();
    if head.chars().count() < text.chars().count() {
        if let Some(end) = head.rfind(['.', '!', '?']) {
            if end > 0 {
                return head.get(..=end).unwrap_or(&head).trim().to_string();
            }
        }
    }
    head.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractive_summary_cuts_at_sentence_end() {
        let text = "Supply of road salt. Deadline 1 March. Lots are regional and the rest is long";
        assert_eq!(
            extractive_summary(text, 45),
            "Supply of road salt. Deadline 1 March."
        );
        assert_eq!(extractive_summary("Short text", 45), "Short text");
    }
}
