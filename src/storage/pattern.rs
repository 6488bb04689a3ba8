//! Glob matching for `KEYS`.
//!
//! Supported syntax:
//! - `*` any run of bytes, including none
//! - `?` exactly one byte
//! - `[abc]`, `[a-z]`, `[^a]` byte classes
//! - `\x` the literal byte `x`

/// A compiled `KEYS` pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: Vec<u8>,
}

impl GlobPattern {
    pub fn new(pattern: impl AsRef<[u8]>) -> Self {
        Self {
            pattern: pattern.as_ref().to_vec(),
        }
    }

    /// True for the `*` pattern, which lets callers skip matching entirely.
    pub fn matches_all(&self) -> bool {
        self.pattern == b"*"
    }

    /// Matches in `O(pattern * text)`: on a mismatch only the most recent
    /// `*` is retried, one byte further along the text.
    pub fn matches(&self, text: &[u8]) -> bool {
        let pattern = &self.pattern[..];
        let (mut p, mut t) = (0, 0);
        // Pattern index after the last `*`, and the text index it resumes from.
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            if pattern.get(p) == Some(&b'*') {
                p += 1;
                star = Some((p, t));
                continue;
            }
            if let Some(width) = match_one(pattern, p, text[t]) {
                p += width;
                t += 1;
                continue;
            }
            match star {
                Some((after_star, from)) => {
                    p = after_star;
                    t = from + 1;
                    star = Some((after_star, t));
                }
                None => return false,
            }
        }

        pattern[p..].iter().all(|&b| b == b'*')
    }
}

/// Matches the single-byte token at `pattern[p]` against `byte`.
///
/// Returns the token's width in the pattern, or `None` on a mismatch or at
/// the end of the pattern. `*` is handled by the caller.
fn match_one(pattern: &[u8], p: usize, byte: u8) -> Option<usize> {
    let head = *pattern.get(p)?;
    match head {
        b'?' => Some(1),
        b'[' => match match_class(&pattern[p + 1..], byte) {
            Some((true, class_len)) => Some(1 + class_len),
            Some((false, _)) => None,
            // Unterminated class: treat `[` literally.
            None => (byte == b'[').then_some(1),
        },
        b'\\' if p + 1 < pattern.len() => (pattern[p + 1] == byte).then_some(2),
        literal => (literal == byte).then_some(1),
    }
}

/// Evaluates a class body (after `[`) against `byte`.
///
/// Returns whether it matched and how many pattern bytes the class used,
/// including the closing `]`.
fn match_class(class: &[u8], byte: u8) -> Option<(bool, usize)> {
    let mut i = 0;
    let negate = class.first() == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < class.len() && class[i] != b']' {
        if class[i] == b'\\' && i + 1 < class.len() {
            i += 1;
            matched |= class[i] == byte;
        } else if i + 2 < class.len() && class[i + 1] == b'-' && class[i + 2] != b']' {
            let (lo, hi) = if class[i] <= class[i + 2] {
                (class[i], class[i + 2])
            } else {
                (class[i + 2], class[i])
            };
            matched |= (lo..=hi).contains(&byte);
            i += 2;
        } else {
            matched |= class[i] == byte;
        }
        i += 1;
    }

    if i >= class.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
