//! Greedy token decoding for non-autoregressive output.

/// Tokens never emitted as text.
const SPECIAL_TOKENS: &[&str] = &["<blank>", "<s>", "</s>", "<unk>"];
/// BPE continuation marker: the piece joins the next one without a space.
const CONTINUATION: &str = "@@";

/// Index of the maximum value in a slice.
pub fn argmax(slice: &[f32]) -> usize {
    slice
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(i, _)| i)
}

/// Argmax over the first `token_num` rows of a `[len, vocab]` logits matrix.
pub fn greedy_ids(logits: &[f32], vocab: usize, token_num: usize) -> Vec<usize> {
    if vocab == 0 {
        return Vec::new();
    }
    logits
        .chunks_exact(vocab)
        .take(token_num)
        .map(argmax)
        .collect()
}

/// Turn token ids into text.
///
/// Special tokens are dropped, `@@` pieces are glued to the following
/// piece, Latin words are space-separated and CJK characters are not.
pub fn ids_to_text(ids: &[usize], tokens: &[String]) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut pending = String::new();

    for token in ids.iter().filter_map(|&id| tokens.get(id)) {
        if SPECIAL_TOKENS.contains(&token.as_str()) {
            continue;
        }
        if let Some(piece) = token.strip_suffix(CONTINUATION) {
            pending.push_str(piece);
        } else {
            pending.push_str(token);
            words.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        words.push(pending);
    }

    let mut text = String::new();
    for word in words {
        let needs_space = matches!(
            (text.chars().last(), word.chars().next()),
            (Some(a), Some(b)) if a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric()
        );
        if needs_space {
            text.push(' ');
        }
        text.push_str(&word);
    }
    text
}
