//! Text cleanup applied to each batch before it is flushed.

/// Filler phrases stripped by default.
pub const DEFAULT_FILLERS: &[&str] = &["um", "umm", "uh", "uhh", "er", "you know", "i mean"];

/// Collapse whitespace runs and drop filler phrases.
///
/// A single leading or trailing space survives so consecutive batches keep
/// their word boundary when concatenated.
pub fn normalize(text: &str, fillers: &[String]) -> String {
    let leading = text.starts_with(char::is_whitespace);
    let trailing = text.ends_with(char::is_whitespace);
    let words: Vec<&str> = text.split_whitespace().collect();

    let mut kept = Vec::with_capacity(words.len());
    let mut i = 0;
    while i < words.len() {
        match fillers.iter().find_map(|f| filler_len(&words[i..], f)) {
            Some(n) => i += n,
            None => {
                kept.push(words[i]);
                i += 1;
            }
        }
    }

    let mut out = kept.join(" ");
    if out.is_empty() {
        return if leading || trailing {
            " ".to_owned()
        } else {
            out
        };
    }
    if leading {
        out.insert(0, ' ');
    }
    if trailing {
        out.push(' ');
    }
    out
}

/// Words consumed if `filler` starts at `words[0]`.
fn filler_len(words: &[&str], filler: &str) -> Option<usize> {
    let parts: Vec<&str> = filler.split_whitespace().collect();
    if parts.is_empty() || parts.len() > words.len() {
        return None;
    }
    let matches = parts.iter().zip(words).all(|(part, word)| {
        word.trim_end_matches([',', '.', '!', '?'])
            .eq_ignore_ascii_case(part)
    });
    // Keep sentence punctuation attached to a stripped filler, except commas.
    let last = words[parts.len() - 1];
    (matches && !last.ends_with(['.', '!', '?'])).then_some(parts.len())
}
