use std::borrow::Cow;

/// Ellipsis appended when text is cut short
const ELLIPSIS: &str = "...";

/// Normalizes scraped page-title text for storage and display.
///
/// Decodes the common HTML entities, drops control characters and collapses
/// every run of whitespace (including newlines inside `<title>`) into a single
/// space. Leading and trailing whitespace is removed.
///
/// # Examples
///
/// ```
/// use linkharvest::util::clean_title;
///
/// assert_eq!(clean_title("  Rust &amp; You\n  - Blog "), "Rust & You - Blog");
/// ```
pub fn clean_title(raw: &str) -> String {
    let decoded = decode_entities(raw);
    let mut out = String::with_capacity(decoded.len());
    let mut pending_space = false;

    for c in decoded.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if c.is_control() {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    out
}

/// Decodes the named entities that show up in titles plus numeric references.
///
/// Unknown or malformed entities are left untouched. Returns
/// `Cow::Borrowed` when the input contains no `&` at all.
pub fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];

        // Entities are short; anything longer is literal text
        let decoded = tail
            .get(1..tail.len().min(12))
            .and_then(|window| window.find(';'))
            .and_then(|semi| {
                let name = &tail[1..=semi];
                decode_entity(name).map(|c| (c, semi + 2))
            });

        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);

    Cow::Owned(out)
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Truncates to at most `max_chars` characters, appending "..." when cut.
///
/// Returns `Cow::Borrowed` when the string already fits.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let cut = s.char_indices().nth(keep).map(|(i, _)| i).unwrap_or(s.len());
    Cow::Owned(format!("{}{}", &s[..cut], ELLIPSIS))
}
