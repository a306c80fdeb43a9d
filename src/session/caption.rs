use std::time::Duration;

/// Symbols used only for display emphasis; dropped before tokenizing
const MARKUP: &[char] = &['*', '#', '`'];

/// Word highlighting of a reply, driven by playback progress.
///
/// The highlighted prefix is proportional to elapsed playback time; it is an
/// approximation and does not follow actual word timing.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionState {
    full_text: String,
    tokens: Vec<String>,
    highlighted: usize,
    progress: f64,
}

impl CaptionState {
    pub fn new(text: impl Into<String>) -> Self {
        let full_text = text.into();
        let tokens = strip_markup(&full_text)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Self {
            full_text,
            tokens,
            highlighted: 0,
            progress: 0.0,
        }
    }

    /// Recompute highlighting for a playback position
    pub fn update(&mut self, position: Duration, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.progress = (position.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0);
        self.highlighted = ((self.progress * self.tokens.len() as f64).floor() as usize)
            .min(self.tokens.len());
    }

    /// Playback ended: every word is highlighted whatever the last tick said
    pub fn complete(&mut self) {
        self.progress = 1.0;
        self.highlighted = self.tokens.len();
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn highlighted_count(&self) -> usize {
        self.highlighted
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn is_complete(&self) -> bool {
        self.highlighted == self.tokens.len()
    }

    /// Words in order, each with whether it is highlighted
    pub fn segments(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.tokens
            .iter()
            .enumerate()
            .map(|(i, word)| (word.as_str(), i < self.highlighted))
    }
}

fn strip_markup(text: &str) -> String {
    text.chars().filter(|c| !MARKUP.contains(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn half_way_through_three_words() {
        let mut caption = CaptionState::new("Hello world foo");
        caption.update(secs(1.0), secs(2.0));
        assert_eq!(caption.token_count(), 3);
        assert_eq!(caption.highlighted_count(), 1);

        caption.update(secs(2.0), secs(2.0));
        assert_eq!(caption.highlighted_count(), 3);
    }

    #[test]
    fn end_forces_full_highlight() {
        let mut caption = CaptionState::new("one two three four five six seven");
        caption.update(secs(0.99), secs(1.0));
        assert_eq!(caption.highlighted_count(), 6);

        caption.complete();
        assert_eq!(caption.highlighted_count(), 7);
        assert!(caption.is_complete());
    }

    #[test]
    fn markup_is_not_a_word() {
        let caption = CaptionState::new("## Title\n**bold** and `code` * here");
        let words: Vec<&str> = caption.segments().map(|(w, _)| w).collect();
        assert_eq!(words, vec!["Title", "bold", "and", "code", "here"]);
        assert_eq!(caption.full_text(), "## Title\n**bold** and `code` * here");
    }

    #[test]
    fn progress_is_clamped() {
        let mut caption = CaptionState::new("a b");
        caption.update(secs(5.0), secs(1.0));
        assert_eq!(caption.progress(), 1.0);
        assert_eq!(caption.highlighted_count(), 2);
    }

    #[test]
    fn zero_duration_is_ignored() {
        let mut caption = CaptionState::new("a b");
        caption.update(secs(1.0), Duration::ZERO);
        assert_eq!(caption.highlighted_count(), 0);
    }

    #[test]
    fn segments_mark_highlighted_prefix() {
        let mut caption = CaptionState::new("a b c d");
        caption.update(secs(0.5), secs(1.0));
        let marks: Vec<bool> = caption.segments().map(|(_, h)| h).collect();
        assert_eq!(marks, vec![true, true, false, false]);
    }
}
