use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single typed scalar produced by tokenizing raw producer output.
///
/// Serialized untagged so the persistence snapshot stays self-describing
/// JSON: integers reload as `Int`, fractional numbers as `Float`, everything
/// else as `Text`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Token {
    /// Numeric view of the token, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One tick's output from a producer: timestamp, trimmed raw string, and the
/// tokenized scalars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: DateTime<Utc>,
    pub raw: String,
    pub tokens: Vec<Token>,
}

impl Record {
    /// Creates a record stamped with the current wall-clock time.
    pub fn new(raw: impl Into<String>, tokens: Vec<Token>) -> Self {
        Self {
            time: Utc::now(),
            raw: raw.into(),
            tokens,
        }
    }

    /// The empty record: zero instant, empty raw, no tokens.
    pub fn empty() -> Self {
        Self {
            time: DateTime::UNIX_EPOCH,
            raw: String::new(),
            tokens: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.time == DateTime::UNIX_EPOCH && self.raw.is_empty() && self.tokens.is_empty()
    }

    /// Maps label names to token values by position. Positions without a
    /// counterpart on either side are dropped.
    pub fn map_by_labels(&self, labels: &[String]) -> HashMap<String, Token> {
        labels
            .iter()
            .zip(self.tokens.iter())
            .map(|(l, t)| (l.clone(), t.clone()))
            .collect()
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::empty()
    }
}

/// Splits a raw string on runs of Unicode whitespace and coerces each token
/// to i64, then f64, then text. Pure and deterministic; an all-whitespace
/// input yields no tokens.
pub fn tokenize(raw: &str) -> Vec<Token> {
    raw.split_whitespace()
        .map(|word| {
            if let Ok(i) = word.parse::<i64>() {
                return Token::Int(i);
            }
            if let Ok(f) = word.parse::<f64>() {
                return Token::Float(f);
            }
            Token::Text(word.to_string())
        })
        .collect()
}

/// Projects a slice through the given positions. An empty index list returns
/// the input unchanged; out-of-range positions are skipped.
pub fn filter_slice<T: Clone>(input: &[T], indexes: &[usize]) -> Vec<T> {
    if indexes.is_empty() {
        return input.to_vec();
    }

    indexes
        .iter()
        .filter_map(|&i| input.get(i).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_mixed() {
        let tokens = tokenize("1 2.5 foo");
        assert_eq!(
            tokens,
            vec![
                Token::Int(1),
                Token::Float(2.5),
                Token::Text("foo".to_string()),
            ],
        );
    }

    #[test]
    fn test_tokenize_negative_and_large() {
        assert_eq!(tokenize("-42"), vec![Token::Int(-42)]);
        assert_eq!(
            tokenize("9223372036854775808"),
            vec![Token::Float(9223372036854775808.0)],
        );
    }

    #[test]
    fn test_tokenize_whitespace_only_yields_nothing() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \t\n  ").is_empty());
    }

    #[test]
    fn test_tokenize_unicode_whitespace() {
        let tokens = tokenize("a\u{00a0}b");
        assert_eq!(
            tokens,
            vec![Token::Text("a".to_string()), Token::Text("b".to_string())],
        );
    }

    #[test]
    fn test_tokenize_round_trip() {
        for raw in ["1 2 3", "1.5 foo -7", "x y 0.25 99"] {
            let first = tokenize(raw);
            let joined = first
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            assert_eq!(tokenize(&joined), first, "round trip for {raw:?}");
        }
    }

    #[test]
    fn test_filter_slice_projects() {
        let input = vec!["a", "b", "c", "d"];
        let picked = filter_slice(&input, &[2, 0]);
        assert_eq!(picked, vec!["c", "a"]);
    }

    #[test]
    fn test_filter_slice_empty_indexes_returns_all() {
        let input = vec![1, 2, 3];
        assert_eq!(filter_slice(&input, &[]), input);
    }

    #[test]
    fn test_filter_slice_skips_out_of_range() {
        let input = vec![10, 20];
        assert_eq!(filter_slice(&input, &[1, 5]), vec![20]);
    }

    #[test]
    fn test_record_empty() {
        let r = Record::empty();
        assert!(r.is_empty());

        let r = Record::new("1", vec![Token::Int(1)]);
        assert!(!r.is_empty());
    }

    #[test]
    fn test_record_map_by_labels_drops_unpaired() {
        let r = Record::new("1 2", vec![Token::Int(1), Token::Int(2)]);
        let map = r.map_by_labels(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], Token::Int(1));
        assert_eq!(map["b"], Token::Int(2));
    }

    #[test]
    fn test_token_serde_untagged_round_trip() {
        let tokens = vec![
            Token::Int(3),
            Token::Float(1.5),
            Token::Text("foo".to_string()),
        ];
        let json = serde_json::to_string(&tokens).unwrap();
        let back: Vec<Token> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tokens);
    }
}
