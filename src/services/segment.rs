use once_cell::sync::Lazy;
use regex::Regex;

/// A contiguous span of chapter text attributed to one named voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerRun {
    pub speaker: String,
    pub text: String,
}

impl SpeakerRun {
    fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
        }
    }
}

pub const DEFAULT_SPEAKER: &str = "default";

static STRAY_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[/?\w[\w-]*\]").unwrap());

/// Splits chapter text into ordered (speaker, text) runs.
///
/// Speaker runs are delimited by `[name]...[/name]` pairs, matched
/// left-to-right and non-overlapping; the closer must spell the same name. A
/// tag without its matching closer is treated as plain text. Untagged spans
/// belong to the `default` speaker. Runs that trim to nothing are dropped, and
/// a chapter without any tag pair becomes a single `default` run with stray
/// tag markers stripped.
pub fn segment_speakers(text: &str) -> Vec<SpeakerRun> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut found_any = false;

    while let Some((tag_start, name, body, tag_end)) = next_tag_pair(text, pos) {
        found_any = true;
        let before = text[pos..tag_start].trim();
        if !before.is_empty() {
            runs.push(SpeakerRun::new(DEFAULT_SPEAKER, before));
        }
        let body = body.trim();
        if !body.is_empty() {
            runs.push(SpeakerRun::new(name, body));
        }
        pos = tag_end;
    }

    let remaining = text[pos..].trim();
    if !remaining.is_empty() {
        runs.push(SpeakerRun::new(DEFAULT_SPEAKER, remaining));
    }

    if !found_any {
        let clean = STRAY_TAG_RE.replace_all(text, "");
        let clean = clean.trim();
        return if clean.is_empty() {
            Vec::new()
        } else {
            vec![SpeakerRun::new(DEFAULT_SPEAKER, clean)]
        };
    }
    runs
}

/// Finds the next `[name]...[/name]` pair at or after `from`. Returns
/// (open-tag start, name, body, closer end). Openers without a matching closer
/// are skipped and land in the surrounding plain text.
fn next_tag_pair(text: &str, from: usize) -> Option<(usize, &str, &str, usize)> {
    let mut search = from;
    while let Some(rel) = text[search..].find('[') {
        let open = search + rel;
        if let Some((name, body_start)) = parse_opener(&text[open..]) {
            let closer = format!("[/{name}]");
            let body_abs = open + body_start;
            if let Some(close_rel) = text[body_abs..].find(&closer) {
                let close_abs = body_abs + close_rel;
                return Some((
                    open,
                    name,
                    &text[body_abs..close_abs],
                    close_abs + closer.len(),
                ));
            }
        }
        search = open + 1;
    }
    None
}

/// Parses `[name]` at the start of `s`; the name must match `\w[\w-]*`.
/// Returns the name and the byte offset just past the closing bracket.
fn parse_opener(s: &str) -> Option<(&str, usize)> {
    let rest = s.strip_prefix('[')?;
    let mut end = 0;
    for (i, c) in rest.char_indices() {
        if c == ']' {
            end = i;
            break;
        }
        let valid = if i == 0 {
            c.is_alphanumeric() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_' || c == '-'
        };
        if !valid {
            return None;
        }
    }
    if end == 0 {
        return None;
    }
    // '/' never passes the name check, so closers are not misread as openers.
    Some((&rest[..end], end + 2))
}
