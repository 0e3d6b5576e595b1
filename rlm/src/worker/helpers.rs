//! Text helpers exposed to evaluated code under the delegate and maintenance
//! profiles.

use anyhow::{Context, Result, bail};
use regex::Regex;

/// Character-based slice of `text` starting at `start`, at most `len` chars.
pub fn peek(text: &str, start: usize, len: usize) -> String {
    text.chars().skip(start).take(len).collect()
}

/// Regex search over lines.
///
/// Each match is rendered as `"<line_no>: <line>"` (1-based). With a non-zero
/// `context`, neighbouring lines are included as `"<line_no>- <line>"` and
/// overlapping windows are merged; separate windows are divided by `"--"`.
pub fn grep(text: &str, pattern: &str, context: usize) -> Result<Vec<String>> {
    let re = Regex::new(pattern).with_context(|| format!("invalid pattern {pattern:?}"))?;
    let lines: Vec<&str> = text.lines().collect();
    let hits: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(idx, _)| idx)
        .collect();

    if context == 0 {
        return Ok(hits
            .into_iter()
            .map(|idx| format!("{}: {}", idx + 1, lines[idx]))
            .collect());
    }

    let mut out = Vec::new();
    let mut last_emitted: Option<usize> = None;
    for &hit in &hits {
        let mut from = hit.saturating_sub(context);
        let to = (hit + context).min(lines.len() - 1);
        match last_emitted {
            Some(last) if from <= last + 1 => from = from.max(last + 1),
            Some(_) => out.push("--".to_string()),
            None => {}
        }
        for (idx, line) in lines.iter().enumerate().take(to + 1).skip(from) {
            let sep = if hits.binary_search(&idx).is_ok() { ':' } else { '-' };
            out.push(format!("{}{} {}", idx + 1, sep, line));
        }
        last_emitted = Some(last_emitted.map_or(to, |last| last.max(to)));
    }
    Ok(out)
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Cuts prefer a paragraph break, then a line break, then whitespace, and fall
/// back to a hard cut. Consecutive chunks share `overlap` characters.
pub fn split_text(text: &str, max_chars: usize, overlap: usize) -> Result<Vec<String>> {
    if max_chars == 0 {
        bail!("max_chars must be > 0");
    }
    if overlap >= max_chars {
        bail!("overlap ({overlap}) must be smaller than max_chars ({max_chars})");
    }
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let hard_end = (start + max_chars).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            boundary_before(&chars, start, hard_end)
        };
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }
    Ok(chunks)
}

/// Best cut position in `(start, hard_end]`.
fn boundary_before(chars: &[char], start: usize, hard_end: usize) -> usize {
    let window = &chars[start..hard_end];
    let min_len = window.len() / 2;
    let find = |pred: &dyn Fn(usize) -> bool| {
        (min_len.max(1)..=window.len())
            .rev()
            .find(|&cut| pred(cut))
            .map(|cut| start + cut)
    };
    let paragraph = find(&|cut| cut >= 2 && window[cut - 1] == '\n' && window[cut - 2] == '\n');
    let line = || find(&|cut| window[cut - 1] == '\n');
    let space = || find(&|cut| window[cut - 1].is_whitespace());
    paragraph
        .or_else(line)
        .or_else(space)
        .unwrap_or(hard_end)
}
