use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Same,
    Inserted,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    fn new(kind: TokenKind, text: &str) -> Self {
        Self {
            kind,
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Word,
    Space,
    Symbol,
}

fn classify(ch: char) -> CharClass {
    if ch.is_alphanumeric() || ch == '_' {
        CharClass::Word
    } else if ch.is_whitespace() {
        CharClass::Space
    } else {
        CharClass::Symbol
    }
}

/// Splits text into word runs, whitespace runs and single punctuation
/// characters. Concatenating the pieces always reproduces `text`.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0_usize;
    let mut current: Option<CharClass> = None;

    for (index, ch) in text.char_indices() {
        let class = classify(ch);
        match current {
            Some(previous) if previous == class && class != CharClass::Symbol => {}
            Some(_) => {
                tokens.push(&text[start..index]);
                start = index;
            }
            None => {}
        }
        current = Some(class);
    }

    if start < text.len() {
        tokens.push(&text[start..]);
    }
    tokens
}

/// Word-level diff of `original` against `revised` via longest common
/// subsequence. On backtracking ties the revised side is consumed first, so
/// insertions are placed after the deletions they replace.
pub fn diff_words(original: &str, revised: &str) -> Vec<Token> {
    let left = tokenize(original);
    let right = tokenize(revised);
    let m = left.len();
    let n = right.len();
    let width = n + 1;

    let mut table = vec![0_u32; (m + 1) * width];
    for i in 1..=m {
        for j in 1..=n {
            table[i * width + j] = if left[i - 1] == right[j - 1] {
                table[(i - 1) * width + (j - 1)] + 1
            } else {
                table[(i - 1) * width + j].max(table[i * width + (j - 1)])
            };
        }
    }

    let mut changes = Vec::with_capacity(m.max(n));
    let (mut i, mut j) = (m, n);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && left[i - 1] == right[j - 1] {
            changes.push(Token::new(TokenKind::Same, left[i - 1]));
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || table[i * width + (j - 1)] >= table[(i - 1) * width + j]) {
            changes.push(Token::new(TokenKind::Inserted, right[j - 1]));
            j -= 1;
        } else {
            changes.push(Token::new(TokenKind::Deleted, left[i - 1]));
            i -= 1;
        }
    }

    changes.reverse();
    changes
}

/// Reassembles the original side of a diff.
pub fn original_side(tokens: &[Token]) -> String {
    collect_side(tokens, TokenKind::Deleted)
}

/// Reassembles the revised side of a diff.
pub fn revised_side(tokens: &[Token]) -> String {
    collect_side(tokens, TokenKind::Inserted)
}

fn collect_side(tokens: &[Token], changed: TokenKind) -> String {
    tokens
        .iter()
        .filter(|token| token.kind == TokenKind::Same || token.kind == changed)
        .map(|token| token.text.as_str())
        .collect()
}

pub fn has_changes(tokens: &[Token]) -> bool {
    tokens.iter().any(|token| token.kind != TokenKind::Same)
}

/// HTML-safe rendering with `diff-del` / `diff-ins` spans.
pub fn render_markup(tokens: &[Token]) -> String {
    let mut rendered = String::new();
    for token in tokens {
        let escaped = escape_markup(&token.text);
        match token.kind {
            TokenKind::Same => rendered.push_str(&escaped),
            TokenKind::Deleted => {
                rendered.push_str("<span class=\"diff-del\">");
                rendered.push_str(&escaped);
                rendered.push_str("</span>");
            }
            TokenKind::Inserted => {
                rendered.push_str("<span class=\"diff-ins\">");
                rendered.push_str(&escaped);
                rendered.push_str("</span>");
            }
        }
    }
    rendered
}

/// Plain-text rendering in `[-deleted-]{+inserted+}` form, merging adjacent
/// tokens of the same kind.
pub fn render_inline(tokens: &[Token]) -> String {
    let mut rendered = String::new();
    let mut open: Option<TokenKind> = None;

    for token in tokens {
        if open != Some(token.kind) {
            close_inline(&mut rendered, open);
            match token.kind {
                TokenKind::Deleted => rendered.push_str("[-"),
                TokenKind::Inserted => rendered.push_str("{+"),
                TokenKind::Same => {}
            }
            open = Some(token.kind);
        }
        rendered.push_str(&token.text);
    }
    close_inline(&mut rendered, open);
    rendered
}

fn close_inline(rendered: &mut String, open: Option<TokenKind>) {
    match open {
        Some(TokenKind::Deleted) => rendered.push_str("-]"),
        Some(TokenKind::Inserted) => rendered.push_str("+}"),
        _ => {}
    }
}

fn escape_markup(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
