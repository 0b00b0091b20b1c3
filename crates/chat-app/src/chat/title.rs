/// Longest title kept verbatim; anything longer is truncated.
pub const MAX_TITLE_CHARS: usize = 50;

/// Word-boundary breaks are only taken at or after this position, so short
/// leading words do not produce stub titles.
pub const MIN_BREAK_CHARS: usize = 30;

/// Derives a session title from the first user message.
///
/// Text of up to [`MAX_TITLE_CHARS`] characters is used verbatim. Longer text
/// is cut at the last whitespace inside the window that falls at or after
/// [`MIN_BREAK_CHARS`], falling back to a hard cut, with an ellipsis appended.
pub fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }

    let window = &chars[..MAX_TITLE_CHARS];
    let cut = window
        .iter()
        .rposition(|ch| ch.is_whitespace())
        .filter(|position| *position >= MIN_BREAK_CHARS)
        .unwrap_or(MAX_TITLE_CHARS);

    let mut title: String = window[..cut].iter().collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}
