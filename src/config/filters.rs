//! Shard and grep filter parsing

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// 1-based shard selector `current/total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub current: u32,
    pub total: u32,
}

impl Shard {
    /// Whether a zero-based global test index belongs to this shard.
    pub fn selects(&self, index: usize) -> bool {
        index as u32 % self.total == self.current - 1
    }
}

impl FromStr for Shard {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (current, total) = s
            .split_once('/')
            .with_context(|| format!("shard must look like 1/3, got {s:?}"))?;
        let current: u32 = current.trim().parse().context("shard current is not a number")?;
        let total: u32 = total.trim().parse().context("shard total is not a number")?;
        if total == 0 || current == 0 {
            bail!("shard indices are 1-based, got {s:?}");
        }
        if current > total {
            bail!("shard current {current} exceeds total {total}");
        }
        Ok(Shard { current, total })
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

/// A `--grep` filter: either a bare substring or a `/pattern/flags` literal
/// matched against the full test title.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum GrepFilter {
    Substring { needle: String },
    Pattern { source: String, flags: String },
}

impl GrepFilter {
    pub fn parse(raw: &str) -> Self {
        if raw.len() >= 2 && raw.starts_with('/') {
            if let Some(end) = raw.rfind('/') {
                if end > 0 {
                    let flags = &raw[end + 1..];
                    if flags.chars().all(|c| matches!(c, 'i' | 's' | 'm')) {
                        return GrepFilter::Pattern {
                            source: raw[1..end].to_string(),
                            flags: flags.to_string(),
                        };
                    }
                }
            }
        }
        GrepFilter::Substring {
            needle: raw.to_string(),
        }
    }

    /// Compile into a matcher; substring filters never fail.
    pub fn compile(&self) -> Result<CompiledGrep> {
        match self {
            GrepFilter::Substring { needle } => Ok(CompiledGrep::Substring(needle.clone())),
            GrepFilter::Pattern { source, flags } => {
                let regex = RegexBuilder::new(source)
                    .case_insensitive(flags.contains('i'))
                    .dot_matches_new_line(flags.contains('s'))
                    .multi_line(flags.contains('m'))
                    .build()
                    .with_context(|| format!("invalid grep pattern /{source}/{flags}"))?;
                Ok(CompiledGrep::Regex(regex))
            }
        }
    }
}

/// A compiled grep matcher.
pub enum CompiledGrep {
    Substring(String),
    Regex(regex::Regex),
}

impl CompiledGrep {
    pub fn matches(&self, full_title: &str) -> bool {
        match self {
            CompiledGrep::Substring(needle) => full_title.contains(needle.as_str()),
            CompiledGrep::Regex(regex) => regex.is_match(full_title),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_parses_and_selects_disjointly() {
        let shard: Shard = "2/3".parse().unwrap();
        assert_eq!(shard, Shard { current: 2, total: 3 });
        // Indices 1, 4, 7 belong to shard 2 of 3.
        assert!(shard.selects(1));
        assert!(shard.selects(4));
        assert!(!shard.selects(0));
        assert!(!shard.selects(2));
    }

    #[test]
    fn shards_cover_every_index_once() {
        let shards: Vec<Shard> = (1..=3).map(|c| Shard { current: c, total: 3 }).collect();
        for index in 0..20 {
            let owners = shards.iter().filter(|s| s.selects(index)).count();
            assert_eq!(owners, 1, "index {index} selected {owners} times");
        }
    }

    #[test]
    fn shard_rejects_bad_input() {
        assert!("0/3".parse::<Shard>().is_err());
        assert!("4/3".parse::<Shard>().is_err());
        assert!("1-3".parse::<Shard>().is_err());
        assert!("a/b".parse::<Shard>().is_err());
    }

    #[test]
    fn grep_bare_substring() {
        let grep = GrepFilter::parse("login flow");
        let compiled = grep.compile().unwrap();
        assert!(compiled.matches("auth login flow works"));
        assert!(!compiled.matches("signup"));
    }

    #[test]
    fn grep_regex_literal_with_flags() {
        let grep = GrepFilter::parse("/^auth .*flow$/i");
        match &grep {
            GrepFilter::Pattern { source, flags } => {
                assert_eq!(source, "^auth .*flow$");
                assert_eq!(flags, "i");
            }
            other => panic!("expected pattern, got {other:?}"),
        }
        let compiled = grep.compile().unwrap();
        assert!(compiled.matches("Auth login FLOW"));
        assert!(!compiled.matches("other auth flow extra"));
    }

    #[test]
    fn grep_slash_without_flags_is_regex() {
        let grep = GrepFilter::parse("/a|b/");
        let compiled = grep.compile().unwrap();
        assert!(compiled.matches("xx a yy"));
        assert!(compiled.matches("b"));
    }

    #[test]
    fn grep_invalid_regex_surfaces_error() {
        let grep = GrepFilter::parse("/(unclosed/");
        assert!(grep.compile().is_err());
    }
}
