use std::collections::VecDeque;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Recursive character splitter: tries paragraph, line, word and finally
/// character boundaries, then greedily merges pieces up to `chunk_size`
/// characters, carrying up to `chunk_overlap` characters into the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSplitter {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (idx, sep) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len().saturating_sub(1), ""));
        let rest = &separators[(idx + 1).min(separators.len())..];

        let pieces: Vec<&str> = if sep.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(sep).filter(|p| !p.is_empty()).collect()
        };

        let mut out = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();
        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                out.extend(self.merge(&fitting, sep));
                fitting.clear();
            }
            if rest.is_empty() {
                out.push(piece.trim().to_string());
            } else {
                out.extend(self.split_with(piece, rest));
            }
        }
        if !fitting.is_empty() {
            out.extend(self.merge(&fitting, sep));
        }
        out.retain(|c| !c.is_empty());
        out
    }

    fn merge(&self, pieces: &[&str], sep: &str) -> Vec<String> {
        let sep_len = char_len(sep);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        let joiner = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { sep_len };

        for piece in pieces {
            let len = char_len(piece);
            if !current.is_empty() && total + len + joiner(&current) > self.chunk_size {
                push_joined(&mut docs, &current, sep);
                while total > self.chunk_overlap || (total > 0 && total + len + joiner(&current) > self.chunk_size) {
                    let Some(first) = current.pop_front() else { break };
                    total -= char_len(first) + joiner(&current);
                }
            }
            total += len + joiner(&current);
            current.push_back(piece);
        }
        push_joined(&mut docs, &current, sep);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, current: &VecDeque<&str>, sep: &str) {
    let joined = current.iter().copied().collect::<Vec<_>>().join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}
