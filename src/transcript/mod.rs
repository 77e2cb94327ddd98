/// Annotations speech engines write inline instead of words. Matched without
/// regard to case inside `[]`, `()` or `<>`.
const NON_SPEECH_TAGS: &[&str] = &[
    "applause",
    "blank_audio",
    "cough",
    "inaudible",
    "laughter",
    "music",
    "noise",
    "silence",
    "unk",
];

/// Cleans a recognizer fragment before it lands in the dictation draft.
pub fn sanitize_speech_fragment(input: &str) -> String {
    normalize_whitespace(&drop_non_speech_annotations(input))
}

/// Joins finalized dictation text with the latest interim hypothesis.
pub fn join_fragments(finals: &str, interim: &str) -> String {
    match (finals.is_empty(), interim.is_empty()) {
        (true, _) => interim.to_string(),
        (false, true) => finals.to_string(),
        (false, false) => format!("{finals} {interim}"),
    }
}

/// Removes structural formatting so a synthesizer reads prose only.
pub fn strip_markup(input: &str) -> String {
    let mut lines = Vec::new();
    let mut in_fence = false;
    for raw_line in input.lines() {
        let line = raw_line.trim();
        if line.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let line = line.trim_start_matches('>').trim_start();
        let line = line.trim_start_matches('#').trim_start();
        let line = strip_bullet(line);
        let line = line.replace("**", "").replace("__", "").replace('`', "");
        let line = normalize_whitespace(&line);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Transcript rendering of a message body: bold markers removed and leading
/// `* ` bullets shown as `• `.
pub fn transcript_body(input: &str) -> String {
    input
        .replace("**", "")
        .lines()
        .map(|line| {
            let indent_len = line.len() - line.trim_start().len();
            let (indent, rest) = line.split_at(indent_len);
            match rest.strip_prefix("* ") {
                Some(item) => format!("{indent}• {item}"),
                None => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_bullet(line: &str) -> &str {
    line.strip_prefix("* ")
        .or_else(|| line.strip_prefix("- "))
        .unwrap_or(line)
}

fn drop_non_speech_annotations(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(|ch: char| matches!(ch, '[' | '(' | '<')) {
        output.push_str(&rest[..start]);
        let tail = &rest[start..];
        let closer = match tail.as_bytes()[0] {
            b'[' => ']',
            b'(' => ')',
            _ => '>',
        };
        match tail[1..].find(closer) {
            Some(len) if is_non_speech_tag(&tail[1..1 + len], closer == ']') => {
                rest = &tail[len + 2..];
            }
            _ => {
                output.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
    }
    output.push_str(rest);
    output
}

fn is_non_speech_tag(inner: &str, square: bool) -> bool {
    let tag = inner.trim();
    if tag.is_empty() {
        return false;
    }
    if NON_SPEECH_TAGS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(tag))
    {
        return true;
    }
    // Engines also emit ad-hoc shouted tags in square brackets, e.g. [DOOR SLAMS].
    square
        && tag.len() <= 32
        && tag.chars().any(|ch| ch.is_ascii_uppercase())
        && tag
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || matches!(ch, '_' | '-' | ' '))
}

fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
