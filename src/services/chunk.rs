/// Sentence-respecting chunker. Yields chunks of at most `max_size`
/// characters, never splitting inside a sentence; a single sentence longer
/// than `max_size` is emitted whole as its own oversized chunk.
pub fn chunk_sentences(text: &str, max_size: usize) -> SentenceChunks {
    SentenceChunks {
        sentences: split_sentences(text).into_iter(),
        pending: None,
        max_size,
    }
}

pub struct SentenceChunks {
    sentences: std::vec::IntoIter<String>,
    pending: Option<String>,
    max_size: usize,
}

impl Iterator for SentenceChunks {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut chunk = self.pending.take().unwrap_or_default();
        loop {
            let Some(sentence) = self.sentences.next() else {
                return if chunk.is_empty() { None } else { Some(chunk) };
            };
            if chunk.is_empty() {
                // An oversized sentence becomes its own chunk.
                chunk = sentence;
                if chunk.chars().count() >= self.max_size {
                    return Some(chunk);
                }
            } else if chunk.chars().count() + 1 + sentence.chars().count() <= self.max_size {
                chunk.push(' ');
                chunk.push_str(&sentence);
            } else {
                self.pending = Some(sentence);
                return Some(chunk);
            }
        }
    }
}

/// Splits text into trimmed sentences. A sentence ends at a run of `. ! ? …`
/// (plus any closing quote) followed by whitespace or end of input. Text
/// without terminators is a single sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut in_terminator = false;

    for c in text.chars() {
        if matches!(c, '.' | '!' | '?' | '…') {
            current.push(c);
            in_terminator = true;
        } else if in_terminator && matches!(c, '"' | '\u{201d}' | '\u{2019}' | '\'' | ')') {
            current.push(c);
        } else if in_terminator && c.is_whitespace() {
            let s = current.trim();
            if !s.is_empty() {
                sentences.push(s.to_string());
            }
            current.clear();
            in_terminator = false;
        } else {
            current.push(c);
            in_terminator = false;
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        sentences.push(s.to_string());
    }
    sentences
}
