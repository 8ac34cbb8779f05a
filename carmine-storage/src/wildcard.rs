//! Glob pattern matching for `KEYS`.
//!
//! Supports `*`, `?`, `[abc]`, `[a-z]`, and `\`-escaped literals, the
//! subset the reference server's `KEYS` understands.

/// Compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    items: Vec<Item>,
}

#[derive(Debug, Clone)]
enum Item {
    Literal(char),
    Any,
    AnyRun,
    Class { chars: Vec<char>, ranges: Vec<(char, char)> },
}

impl Pattern {
    /// Compiles a pattern; malformed classes fall back to literals.
    #[must_use]
    pub fn compile(pattern: &str) -> Self {
        let mut items = Vec::new();
        let mut chars = pattern.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '*' => {
                    if !matches!(items.last(), Some(Item::AnyRun)) {
                        items.push(Item::AnyRun);
                    }
                }
                '?' => items.push(Item::Any),
                '\\' => items.push(Item::Literal(chars.next().unwrap_or('\\'))),
                '[' => {
                    let mut class_chars = Vec::new();
                    let mut ranges = Vec::new();
                    let mut closed = false;
                    while let Some(inner) = chars.next() {
                        if inner == ']' {
                            closed = true;
                            break;
                        }
                        if chars.peek() == Some(&'-') {
                            let _ = chars.next();
                            match chars.next() {
                                Some(']') => {
                                    class_chars.push(inner);
                                    class_chars.push('-');
                                    closed = true;
                                    break;
                                }
                                Some(end) => ranges.push((inner, end)),
                                None => class_chars.push(inner),
                            }
                        } else {
                            class_chars.push(inner);
                        }
                    }
                    if closed {
                        items.push(Item::Class {
                            chars: class_chars,
                            ranges,
                        });
                    } else {
                        items.push(Item::Literal('['));
                        for saved in class_chars {
                            items.push(Item::Literal(saved));
                        }
                    }
                }
                other => items.push(Item::Literal(other)),
            }
        }
        Self { items }
    }

    /// Returns whether `text` matches the pattern.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        self.match_from(0, &chars, 0)
    }

    fn match_from(&self, item_index: usize, text: &[char], text_index: usize) -> bool {
        let Some(item) = self.items.get(item_index) else {
            return text_index == text.len();
        };
        match item {
            Item::AnyRun => (text_index..=text.len())
                .any(|skip| self.match_from(item_index + 1, text, skip)),
            Item::Any => {
                text_index < text.len() && self.match_from(item_index + 1, text, text_index + 1)
            }
            Item::Literal(expected) => {
                text.get(text_index) == Some(expected)
                    && self.match_from(item_index + 1, text, text_index + 1)
            }
            Item::Class { chars, ranges } => {
                let Some(actual) = text.get(text_index) else {
                    return false;
                };
                let hit = chars.contains(actual)
                    || ranges
                        .iter()
                        .any(|(low, high)| (*low..=*high).contains(actual));
                hit && self.match_from(item_index + 1, text, text_index + 1)
            }
        }
    }
}
