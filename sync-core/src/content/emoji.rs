//! Emoji-only message detection.

use unicode_segmentation::UnicodeSegmentation;

const ZERO_WIDTH_JOINER: char = '\u{200D}';
const VARIATION_SELECTOR_16: char = '\u{FE0F}';
const COMBINING_KEYCAP: char = '\u{20E3}';

/// True if `text` consists only of emoji graphemes, ignoring whitespace.
///
/// Empty or whitespace-only text is not emoji-only.
pub fn is_only_emojis(text: &str) -> bool {
    let mut seen_emoji = false;
    for grapheme in text.graphemes(true) {
        if grapheme.chars().all(char::is_whitespace) {
            continue;
        }
        if !is_emoji_grapheme(grapheme) {
            return false;
        }
        seen_emoji = true;
    }
    seen_emoji
}

fn is_emoji_grapheme(grapheme: &str) -> bool {
    let mut chars = grapheme.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if matches!(first, '0'..='9' | '#' | '*') {
        return grapheme.contains(COMBINING_KEYCAP);
    }
    if !is_emoji_base(first) {
        return false;
    }
    chars.all(|c| is_emoji_base(c) || is_emoji_modifier(c))
}

fn is_emoji_modifier(c: char) -> bool {
    matches!(
        c,
        ZERO_WIDTH_JOINER
            | VARIATION_SELECTOR_16
            | COMBINING_KEYCAP
            | '\u{1F3FB}'..='\u{1F3FF}'
            | '\u{E0020}'..='\u{E007F}'
    )
}

fn is_emoji_base(c: char) -> bool {
    matches!(
        c,
        '\u{00A9}'
            | '\u{00AE}'
            | '\u{203C}'
            | '\u{2049}'
            | '\u{2122}'
            | '\u{2139}'
            | '\u{2194}'..='\u{2199}'
            | '\u{21A9}'..='\u{21AA}'
            | '\u{231A}'..='\u{231B}'
            | '\u{2328}'
            | '\u{23CF}'
            | '\u{23E9}'..='\u{23F3}'
            | '\u{23F8}'..='\u{23FA}'
            | '\u{24C2}'
            | '\u{25AA}'..='\u{25AB}'
            | '\u{25B6}'
            | '\u{25C0}'
            | '\u{25FB}'..='\u{25FE}'
            | '\u{2600}'..='\u{27BF}'
            | '\u{2934}'..='\u{2935}'
            | '\u{2B05}'..='\u{2B07}'
            | '\u{2B1B}'..='\u{2B1C}'
            | '\u{2B50}'
            | '\u{2B55}'
            | '\u{3030}'
            | '\u{303D}'
            | '\u{3297}'
            | '\u{3299}'
            | '\u{1F000}'..='\u{1FAFF}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_multiple_emoji() {
        assert!(is_only_emojis("🎉"));
        assert!(is_only_emojis("🐈 🐕"));
        assert!(is_only_emojis("❤️"));
    }

    #[test]
    fn sequences_are_single_graphemes() {
        // family ZWJ sequence, skin tone, flag, keycap
        assert!(is_only_emojis("👨‍👩‍👧"));
        assert!(is_only_emojis("👍🏽"));
        assert!(is_only_emojis("🇫🇮"));
        assert!(is_only_emojis("1️⃣"));
    }

    #[test]
    fn text_is_not_emoji() {
        assert!(!is_only_emojis("hi 🎉"));
        assert!(!is_only_emojis("1"));
        assert!(!is_only_emojis(""));
        assert!(!is_only_emojis("   "));
    }
}
