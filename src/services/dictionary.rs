use regex::RegexBuilder;
use std::collections::BTreeMap;

/// Applies user dictionary replacements to text before synthesis.
///
/// Rules (matching the persisted dictionary contract):
/// - case-insensitive matching
/// - a word only matches when preceded by start-of-line, whitespace or hyphen
/// - and followed by end-of-line, whitespace, hyphen or one of `! ? . , ; :`
/// - longer entries are applied first so multi-word phrases are not shadowed
///   by their substrings; the output of an earlier replacement is not
///   deliberately protected from later entries, shorter keys simply no longer
///   find a boundary match inside it.
///
/// An empty dictionary is the identity function.
pub fn apply_dictionary(entries: &BTreeMap<String, String>, text: &str) -> String {
    if entries.is_empty() {
        return text.to_string();
    }

    // Longest key first; BTreeMap iteration makes the tie-break lexicographic
    // and deterministic.
    let mut sorted: Vec<(&String, &String)> = entries.iter().collect();
    sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));

    let mut text = text.to_string();
    for (word, replacement) in sorted {
        if word.is_empty() {
            continue;
        }
        let pattern = format!(
            r"(^|[\s\-]){}($|[\s!?.,;:\-])",
            regex::escape(word)
        );
        let re = match RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
        {
            Ok(re) => re,
            Err(_) => continue,
        };
        // The left boundary character is consumed by the match and must be
        // preserved; the right boundary stays in place for the next match, so
        // rebuild the string manually instead of using a lookahead.
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        while let Some(caps) = re.captures(&text[last..]) {
            let (Some(left), Some(right)) = (caps.get(1), caps.get(2)) else {
                break;
            };
            // The pattern starts with the left boundary group, so the whole
            // match starts where `left` starts.
            out.push_str(&text[last..last + left.start()]);
            out.push_str(left.as_str());
            out.push_str(replacement);
            // Right boundary is not consumed; resume scanning from it.
            last += right.start();
        }
        out.push_str(&text[last..]);
        text = out;
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_dictionary_is_identity() {
        let d = BTreeMap::new();
        assert_eq!(apply_dictionary(&d, "Zażółć gęślą jaźń"), "Zażółć gęślą jaźń");
        assert_eq!(apply_dictionary(&d, ""), "");
    }

    #[test]
    fn test_longest_match_first() {
        let d = dict(&[("San Francisco", "SF"), ("Francisco", "Frank")]);
        assert_eq!(
            apply_dictionary(&d, "I live in San Francisco"),
            "I live in SF"
        );
        assert_eq!(apply_dictionary(&d, "Just Francisco"), "Just Frank");
    }

    #[test]
    fn test_word_boundaries() {
        let d = dict(&[("cat", "dog")]);
        assert_eq!(apply_dictionary(&d, "concatenate"), "concatenate");
        assert_eq!(apply_dictionary(&d, "the cat sat"), "the dog sat");
        assert_eq!(apply_dictionary(&d, "cat"), "dog");
        assert_eq!(apply_dictionary(&d, "a cat."), "a dog.");
        assert_eq!(apply_dictionary(&d, "cat-flap"), "dog-flap");
        assert_eq!(apply_dictionary(&d, "scat"), "scat");
    }

    #[test]
    fn test_case_insensitive() {
        let d = dict(&[("dr", "doktor")]);
        assert_eq!(apply_dictionary(&d, "Dr Kowalski"), "doktor Kowalski");
        assert_eq!(apply_dictionary(&d, "DR Kowalski"), "doktor Kowalski");
    }

    #[test]
    fn test_left_boundary_preserved() {
        let d = dict(&[("np", "na przykład")]);
        assert_eq!(apply_dictionary(&d, "weź np. to"), "weź na przykład. to");
        assert_eq!(apply_dictionary(&d, "np. to"), "na przykład. to");
    }

    #[test]
    fn test_multiple_occurrences() {
        let d = dict(&[("ok", "okay")]);
        assert_eq!(apply_dictionary(&d, "ok, ok and ok"), "okay, okay and okay");
    }

    #[test]
    fn test_multiline() {
        let d = dict(&[("cdn", "ciąg dalszy nastąpi")]);
        assert_eq!(
            apply_dictionary(&d, "koniec\ncdn"),
            "koniec\nciąg dalszy nastąpi"
        );
    }
}
