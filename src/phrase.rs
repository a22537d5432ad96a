//! Enrollment prompts and random challenge phrases.

use crate::defaults;
use rand::Rng;
use rand::seq::SliceRandom;
use std::fmt;

/// Words challenge phrases are drawn from.
pub const DICTIONARY: &[&str] = &[
    "banana", "river", "laptop", "mirror", "coffee", "jungle", "shadow", "pencil", "rocket",
    "garden", "thunder", "cloud", "window", "candle", "mountain", "whisper", "ocean", "storm",
    "planet", "sunset", "blanket", "library", "bottle", "glasses", "forest", "pillow", "umbrella",
    "wallet", "button", "camera", "island", "notebook", "lantern", "snowflake", "aeroplane",
    "diamond", "kitchen", "violin", "carpet", "penguin", "teacup", "backpack", "helmet", "jacket",
    "necklace", "zebra", "audio", "shield",
];

/// Fixed prompts read aloud during the three enrollment rounds.
pub const ENROLLMENT_PROMPTS: [&str; defaults::ENROLLMENT_ROUNDS] = [
    "My name is [Full Name], and Audio Shield secures and protects your voice.",
    "A mad boxer shot a quick, gloved jab to the jaw of his dizzy opponent.",
    "The quick brown fox jumps over the lazy dog.",
];

/// Prompt for a 1-based enrollment round.
pub fn enrollment_prompt(round: usize) -> Option<&'static str> {
    round
        .checked_sub(1)
        .and_then(|index| ENROLLMENT_PROMPTS.get(index))
        .copied()
}

/// Words the user must say for one verification attempt.
///
/// Not `Clone`: a phrase is moved into the attempt that uses it.
#[derive(Debug, PartialEq, Eq)]
pub struct ChallengePhrase {
    words: Vec<&'static str>,
}

impl ChallengePhrase {
    pub fn words(&self) -> &[&'static str] {
        &self.words
    }

    pub fn text(&self) -> String {
        self.words.join(" ")
    }
}

impl fmt::Display for ChallengePhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Draws challenge phrases without replacement from [`DICTIONARY`].
///
/// Never yields an enrollment prompt and never yields the same phrase twice
/// in a row.
#[derive(Debug)]
pub struct PhraseGenerator<R: Rng = rand::rngs::StdRng> {
    rng: R,
    word_count: usize,
    last: Option<Vec<&'static str>>,
}

impl PhraseGenerator {
    /// Generator seeded from the operating system.
    pub fn new(word_count: usize) -> Self {
        Self::with_rng(rand::SeedableRng::from_entropy(), word_count)
    }
}

impl<R: Rng> PhraseGenerator<R> {
    /// `word_count` is clamped to 1..=DICTIONARY.len().
    pub fn with_rng(rng: R, word_count: usize) -> Self {
        Self {
            rng,
            word_count: word_count.clamp(1, DICTIONARY.len()),
            last: None,
        }
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn next_phrase(&mut self) -> ChallengePhrase {
        loop {
            let words: Vec<&'static str> = DICTIONARY
                .choose_multiple(&mut self.rng, self.word_count)
                .copied()
                .collect();
            let text = words.join(" ");
            let repeats_last = self.last.as_ref() == Some(&words);
            let is_prompt = ENROLLMENT_PROMPTS
                .iter()
                .any(|prompt| prompt.eq_ignore_ascii_case(&text));
            // A single-word dictionary could never satisfy the repeat rule.
            if (!repeats_last || DICTIONARY.len() == 1) && !is_prompt {
                self.last = Some(words.clone());
                return ChallengePhrase { words };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn test_dictionary_has_unique_lowercase_words() {
        assert_eq!(DICTIONARY.len(), 48);
        let unique: HashSet<_> = DICTIONARY.iter().collect();
        assert_eq!(unique.len(), DICTIONARY.len());
        assert!(DICTIONARY.iter().all(|w| w.chars().all(|c| c.is_ascii_lowercase())));
    }

    #[test]
    fn test_enrollment_prompts_are_distinct() {
        let unique: HashSet<_> = ENROLLMENT_PROMPTS.iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(enrollment_prompt(1), Some(ENROLLMENT_PROMPTS[0]));
        assert_eq!(enrollment_prompt(3), Some(ENROLLMENT_PROMPTS[2]));
        assert_eq!(enrollment_prompt(0), None);
        assert_eq!(enrollment_prompt(4), None);
    }

    #[test]
    fn test_phrase_draws_without_replacement() {
        let mut generator = PhraseGenerator::with_rng(StdRng::seed_from_u64(7), 6);
        for _ in 0..200 {
            let phrase = generator.next_phrase();
            assert_eq!(phrase.words().len(), 6);
            let unique: HashSet<_> = phrase.words().iter().collect();
            assert_eq!(unique.len(), 6, "repeated word in {}", phrase);
            assert!(phrase.words().iter().all(|w| DICTIONARY.contains(w)));
        }
    }

    #[test]
    fn test_phrase_never_matches_an_enrollment_prompt() {
        let mut generator = PhraseGenerator::with_rng(StdRng::seed_from_u64(11), 9);
        for _ in 0..200 {
            let text = generator.next_phrase().text();
            assert!(!ENROLLMENT_PROMPTS.iter().any(|p| p.eq_ignore_ascii_case(&text)));
        }
    }

    #[test]
    fn test_consecutive_phrases_differ() {
        // One word from 48 repeats often by chance; the generator must redraw.
        let mut generator = PhraseGenerator::with_rng(StdRng::seed_from_u64(3), 1);
        let mut previous = generator.next_phrase();
        for _ in 0..500 {
            let next = generator.next_phrase();
            assert_ne!(next, previous);
            previous = next;
        }
    }

    #[test]
    fn test_word_count_is_clamped() {
        assert_eq!(PhraseGenerator::new(0).word_count(), 1);
        assert_eq!(PhraseGenerator::new(1000).word_count(), DICTIONARY.len());
        assert_eq!(PhraseGenerator::new(1000).next_phrase().words().len(), 48);
    }

    #[test]
    fn test_display_joins_words() {
        let mut generator = PhraseGenerator::with_rng(StdRng::seed_from_u64(1), 3);
        let phrase = generator.next_phrase();
        assert_eq!(phrase.to_string().split(' ').count(), 3);
    }
}
