//! Run parameter handling.
//!
//! Parameters come from the DAG's `params` defaults and an optional
//! override string (`-p "FOO=1 bar"`). Tokens are split shell-style, so
//! `NAME="a b"` is a single token. `KEY=value` tokens become named
//! variables; anything else is positional and exported as `$1`, `$2`, ….

/// One run's effective parameters.
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    /// Named parameters in declaration order.
    pub named: Vec<(String, String)>,
    /// Positional parameters, 1-indexed at expansion time.
    pub positional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Named(String, String),
    Positional(String),
}

/// Tokenize one parameter string shell-style.
fn tokenize(raw: &str) -> Vec<Token> {
    let words = shlex::split(raw).unwrap_or_else(|| {
        // Unbalanced quotes: fall back to whitespace splitting rather than
        // dropping the user's input on the floor.
        raw.split_whitespace().map(str::to_string).collect()
    });
    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if is_identifier(key) => {
                Token::Named(key.to_string(), value.to_string())
            }
            _ => Token::Positional(word),
        })
        .collect()
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a raw parameter string into a [`ParamSet`].
pub fn parse_param_string(raw: &str) -> ParamSet {
    let mut set = ParamSet::default();
    for token in tokenize(raw) {
        match token {
            Token::Named(k, v) => set.named.push((k, v)),
            Token::Positional(v) => set.positional.push(v),
        }
    }
    set
}

/// A defaults-list entry is one declaration: everything after the first
/// `=` is the value, spaces included. Only override strings get shell
/// tokenization.
fn entry_token(entry: &str) -> Token {
    match entry.split_once('=') {
        Some((key, value)) if is_identifier(key) => {
            Token::Named(key.to_string(), value.to_string())
        }
        _ => Token::Positional(entry.to_string()),
    }
}

impl ParamSet {
    /// Combine DAG defaults with an override string. Named overrides
    /// replace matching defaults; positional overrides replace by index.
    pub fn build(defaults: &[String], overrides: Option<&str>) -> ParamSet {
        let mut set = ParamSet::default();
        for entry in defaults {
            match entry_token(entry) {
                Token::Named(k, v) => set.named.push((k, v)),
                Token::Positional(v) => set.positional.push(v),
            }
        }
        if let Some(raw) = overrides {
            let over = parse_param_string(raw);
            for (key, value) in over.named {
                match set.named.iter_mut().find(|(k, _)| *k == key) {
                    Some(entry) => entry.1 = value,
                    None => set.named.push((key, value)),
                }
            }
            for (i, value) in over.positional.into_iter().enumerate() {
                if i < set.positional.len() {
                    set.positional[i] = value;
                } else {
                    set.positional.push(value);
                }
            }
        }
        set
    }

    /// All variables this set contributes to a node environment: named
    /// pairs plus `1`, `2`, … for positionals.
    pub fn variables(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.named.iter().cloned().chain(
            self.positional
                .iter()
                .enumerate()
                .map(|(i, v)| ((i + 1).to_string(), v.clone())),
        )
    }

    /// Canonical single-string rendering, stored in the run snapshot.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for (k, v) in &self.named {
            parts.push(format!("{k}={}", quote(v)));
        }
        for v in &self.positional {
            parts.push(quote(v));
        }
        parts.join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}
