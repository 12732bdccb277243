//! Lightweight entity and follow-up heuristics for conversation turns

const MAX_ENTITIES: usize = 10;
const MIN_ENTITY_CHARS: usize = 3;
const FOLLOW_UP_MAX_WORDS: usize = 6;
const PRONOUN_DENSITY: f32 = 0.15;

/// Capitalized words that are not names
const STOPWORDS: &[&str] = &[
    "The", "A", "An", "I", "This", "That", "These", "Those", "Who", "What", "When", "Where",
    "Why", "How", "Which", "Whom", "Whose", "Is", "Was", "Are", "Were", "Did", "Does", "Do",
    "And", "Or", "But", "He", "She", "It", "They", "Them", "Him", "Her", "His", "Their", "We",
    "You", "Tell", "Compare", "Describe", "Explain", "Summarize", "List", "Give", "Also",
    "Then", "After", "Before", "In", "On", "At", "Of", "For", "With", "About",
];

const FOLLOW_UP_INDICATORS: &[&str] = &[
    "what about",
    "how about",
    "tell me more",
    "and",
    "also",
    "additionally",
    "furthermore",
    "what happened",
    "and then",
    "after that",
    "why",
    "how",
    "when",
    "where",
    "he",
    "she",
    "they",
    "it",
    "that",
    "this",
    "those",
];

const PRONOUNS: &[&str] = &["he", "she", "they", "it", "that", "this", "those", "them", "him", "her"];

fn strip(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric())
}

fn is_entity_word(word: &str) -> bool {
    word.chars().count() >= MIN_ENTITY_CHARS
        && word.chars().next().is_some_and(|c| c.is_uppercase())
        && !STOPWORDS.contains(&word)
}

/// Capitalized words longer than two characters, first-seen order, at most ten
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    for word in text.split_whitespace().map(strip) {
        if entities.len() == MAX_ENTITIES {
            break;
        }
        if is_entity_word(word) && !entities.iter().any(|e| e == word) {
            entities.push(word.to_string());
        }
    }
    entities
}

/// A capitalized non-initial word that is not a stopword
pub fn has_named_entity(query: &str) -> bool {
    query
        .split_whitespace()
        .skip(1)
        .map(strip)
        .any(is_entity_word)
}

/// Short indicator-led question or pronoun-heavy text, naming nobody
pub fn is_follow_up(query: &str) -> bool {
    if has_named_entity(query) {
        return false;
    }

    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| strip(w).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return false;
    }

    let starts_with_indicator = words.len() <= FOLLOW_UP_MAX_WORDS
        && FOLLOW_UP_INDICATORS.iter().any(|indicator| {
            let cue: Vec<&str> = indicator.split(' ').collect();
            words.len() >= cue.len() && words.iter().zip(&cue).all(|(w, c)| w == c)
        });
    if starts_with_indicator {
        return true;
    }

    let pronouns = words.iter().filter(|w| PRONOUNS.contains(&w.as_str())).count();
    pronouns as f32 / words.len() as f32 >= PRONOUN_DENSITY
}
