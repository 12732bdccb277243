//! Sentence splitting for evidence extraction

use crate::config::EvidenceConfig;

/// Split on `.`, `!` or `?` followed by whitespace and an uppercase letter
///
/// Whitespace runs are collapsed first. Abbreviations such as "Dr. Smith" do
/// split; lowercase continuations ("e.g. this") do not.
pub fn split_sentences(text: &str) -> Vec<String> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = normalized.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();

    for i in 0..chars.len() {
        current.push(chars[i]);

        let is_terminal = matches!(chars[i], '.' | '!' | '?');
        let boundary = is_terminal
            && i + 2 < chars.len()
            && chars[i + 1] == ' '
            && chars[i + 2].is_uppercase();
        if boundary {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Splitter with the length limits applied
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    min_chars: usize,
    max_chars: usize,
}

impl SentenceSplitter {
    pub fn new(config: &EvidenceConfig) -> Self {
        Self {
            min_chars: config.min_sentence_chars,
            max_chars: config.max_sentence_chars.max(1),
        }
    }

    /// Sentences of at least `min_chars`; longer than `max_chars` are cut and marked with "..."
    pub fn split(&self, text: &str) -> Vec<String> {
        split_sentences(text)
            .into_iter()
            .filter(|s| s.chars().count() >= self.min_chars)
            .map(|s| match s.char_indices().nth(self.max_chars) {
                Some((idx, _)) => format!("{}...", &s[..idx]),
                None => s,
            })
            .collect()
    }
}

/// Byte offset to cut `text` at so it keeps between `min_chars` and `max_chars`
///
/// Prefers the latest clause break (after `,`, `;` or `:`), then the latest
/// word break. `None` when the window holds neither.
pub fn cut_point(text: &str, min_chars: usize, max_chars: usize) -> Option<usize> {
    if min_chars > max_chars {
        return None;
    }
    let mut clause_break = None;
    let mut word_break = None;

    for (count, (idx, ch)) in text.char_indices().enumerate() {
        if count > max_chars {
            break;
        }
        // Cutting before a space keeps `count` chars
        if ch.is_whitespace() && count >= min_chars && count > 0 {
            word_break = Some(idx);
        }
        // Cutting after clause punctuation keeps `count + 1` chars
        if matches!(ch, ',' | ';' | ':') && count + 1 >= min_chars && count + 1 <= max_chars {
            clause_break = Some(idx + ch.len_utf8());
        }
    }

    clause_break.or(word_break)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_capitalised_boundaries() {
        let sentences = split_sentences("Rama was exiled. He went  to the forest!   Sita followed him? Yes.");
        assert_eq!(
            sentences,
            vec![
                "Rama was exiled.",
                "He went to the forest!",
                "Sita followed him?",
                "Yes."
            ]
        );
    }

    #[test]
    fn test_no_split_before_lowercase() {
        let sentences = split_sentences("Many epics exist, e.g. the Ramayana. Another one follows.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("e.g. the Ramayana."));
    }

    #[test]
    fn test_unterminated_tail_is_kept() {
        assert_eq!(split_sentences("No ending punctuation here"), vec!["No ending punctuation here"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_splitter_applies_length_limits() {
        let splitter = SentenceSplitter::new(&EvidenceConfig {
            min_sentence_chars: 11,
            max_sentence_chars: 20,
            ..EvidenceConfig::default()
        });
        let sentences = splitter.split("Too short. This sentence is definitely longer than twenty characters.");
        assert_eq!(sentences, vec!["This sentence is def..."]);
    }

    #[test]
    fn test_cut_point_prefers_clause_break() {
        let text = "Rama crossed the ocean, fought Ravana and returned home";
        let cut = cut_point(text, 15, 40).unwrap();
        assert_eq!(&text[..cut], "Rama crossed the ocean,");

        let cut = cut_point("Rama crossed the ocean with an army", 10, 20).unwrap();
        assert_eq!(&"Rama crossed the ocean with an army"[..cut], "Rama crossed the");

        assert!(cut_point("Supercalifragilistic", 5, 10).is_none());
    }
}
