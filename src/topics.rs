//! # Topic Canonicalization and Matching
//!
//! Topics are hierarchical strings (`a/b/c`, `sensor.temp.celsius`).
//! Canonical form is a sequence of 64-bit tokens, one per cumulative
//! segment prefix, hashed with BLAKE3. Filters built from those tokens
//! drive both local subscription matching and the per-neighbor
//! forwarding admission test.
//!
//! ## Match Semantics
//!
//! A subscribe call carries an ordered topic list. The list is split
//! into OR-groups at the reserved [`GROUP_MARKER`] token; within one
//! group topics are AND-combined. A publication matches the
//! subscription iff at least one group has every one of its topics
//! present in the publication's topic filter.
//!
//! With prefix matching configured (the default), a subscription to
//! `a.b` also matches a publication of `a.b.c`: publication filters
//! insert a token for every cumulative prefix of every topic, so the
//! subscription's own token tests present. Exact mode inserts only the
//! full-string token.

use crate::bloom::{BloomFilter, FilterParams};
use crate::error::MeshError;

/// Separator characters accepted between topic segments.
pub const DEFAULT_SEPARATORS: &str = "/.";

/// Reserved marker splitting one subscribe call into independent
/// OR-groups. Not valid inside a topic name.
pub const GROUP_MARKER: &str = "|";

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Maximum topics carried by a single publication or subscription group.
pub const MAX_TOPICS_PER_MESSAGE: usize = 64;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic != GROUP_MARKER
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// Hash one canonical prefix string to a 64-bit token.
fn hash_token(prefix: &str) -> u64 {
    let digest = blake3::hash(prefix.as_bytes());
    u64::from_le_bytes(
        digest.as_bytes()[0..8]
            .try_into()
            .expect("digest is 32 bytes"),
    )
}

// ============================================================================
// Topic
// ============================================================================

/// A canonicalized hierarchical topic. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    name: String,
    /// Token for the full topic string.
    token: u64,
    /// Tokens for every cumulative segment prefix, ending with `token`.
    prefix_tokens: Vec<u64>,
}

impl Topic {
    /// Canonicalize a topic string, splitting segments on any character
    /// in `separators`.
    pub fn new(name: &str, separators: &str) -> Result<Topic, MeshError> {
        if !is_valid_topic(name) {
            return Err(MeshError::Protocol(format!("invalid topic {:?}", name)));
        }
        let mut prefix_tokens = Vec::new();
        let mut end_indices: Vec<usize> = name
            .char_indices()
            .filter(|(_, c)| separators.contains(*c))
            .map(|(i, _)| i)
            .collect();
        end_indices.push(name.len());
        for end in end_indices {
            if end == 0 {
                continue; // leading separator contributes no prefix
            }
            prefix_tokens.push(hash_token(&name[..end]));
        }
        if prefix_tokens.is_empty() {
            return Err(MeshError::Protocol(format!("invalid topic {:?}", name)));
        }
        let token = *prefix_tokens.last().expect("at least one prefix");
        Ok(Topic {
            name: name.to_string(),
            token,
            prefix_tokens,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token for the full topic string.
    pub fn token(&self) -> u64 {
        self.token
    }
}

// ============================================================================
// TopicMatcher
// ============================================================================

/// Builds filters from topic lists and tests subscriptions against
/// publication topic sets. One matcher per node; its parameters must
/// match across the mesh for interest aggregation to be meaningful.
#[derive(Clone, Debug)]
pub struct TopicMatcher {
    params: FilterParams,
    separators: String,
    prefix_matching: bool,
}

impl TopicMatcher {
    pub fn new(params: FilterParams, separators: &str, prefix_matching: bool) -> Self {
        Self {
            params,
            separators: separators.to_string(),
            prefix_matching,
        }
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }

    /// Canonicalize one topic string with this matcher's separators.
    pub fn topic(&self, name: &str) -> Result<Topic, MeshError> {
        Topic::new(name, &self.separators)
    }

    /// Canonicalize a list of topic strings.
    pub fn topics(&self, names: &[String]) -> Result<Vec<Topic>, MeshError> {
        if names.len() > MAX_TOPICS_PER_MESSAGE {
            return Err(MeshError::Resource);
        }
        names.iter().map(|n| self.topic(n)).collect()
    }

    /// Build a publication-side filter: inserts every token needed so
    /// that a single test per subscription component is sound.
    pub fn build_filter(&self, topics: &[Topic]) -> BloomFilter {
        let mut filter = BloomFilter::new(self.params);
        for topic in topics {
            if self.prefix_matching {
                for token in &topic.prefix_tokens {
                    filter.insert(*token);
                }
            } else {
                filter.insert(topic.token);
            }
        }
        filter
    }

    /// Build a subscription-side interest filter: only the topics' own
    /// tokens, so aggregate interests stay as sparse as possible.
    pub fn interest_filter(&self, groups: &[Vec<Topic>]) -> BloomFilter {
        let mut filter = BloomFilter::new(self.params);
        for group in groups {
            for topic in group {
                filter.insert(topic.token);
            }
        }
        filter
    }

    /// Two-level AND/OR match of a subscription against a publication's
    /// topic filter. Never false-negative; filter false positives are a
    /// separate, bounded phenomenon.
    pub fn matches(&self, groups: &[Vec<Topic>], publication_filter: &BloomFilter) -> bool {
        groups.iter().any(|group| {
            !group.is_empty() && group.iter().all(|t| publication_filter.test(t.token))
        })
    }

    /// Split a raw topic list into OR-groups at the group marker.
    pub fn split_groups(names: &[String]) -> Vec<Vec<String>> {
        let mut groups = Vec::new();
        let mut current = Vec::new();
        for name in names {
            if name == GROUP_MARKER {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
            } else {
                current.push(name.clone());
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new(FilterParams::default(), DEFAULT_SEPARATORS, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> TopicMatcher {
        TopicMatcher::default()
    }

    fn topics(m: &TopicMatcher, names: &[&str]) -> Vec<Topic> {
        names.iter().map(|n| m.topic(n).unwrap()).collect()
    }

    #[test]
    fn canonicalization_rejects_invalid() {
        assert!(Topic::new("", DEFAULT_SEPARATORS).is_err());
        assert!(Topic::new(GROUP_MARKER, DEFAULT_SEPARATORS).is_err());
        assert!(Topic::new(&"x".repeat(MAX_TOPIC_LENGTH + 1), DEFAULT_SEPARATORS).is_err());
        assert!(Topic::new("ok topic", DEFAULT_SEPARATORS).is_ok());
    }

    #[test]
    fn prefix_tokens_cover_hierarchy() {
        let t = Topic::new("a.b.c", DEFAULT_SEPARATORS).unwrap();
        assert_eq!(t.prefix_tokens.len(), 3);
        assert_eq!(*t.prefix_tokens.last().unwrap(), t.token());
        // Prefix tokens equal the tokens of the prefix topics.
        let ab = Topic::new("a.b", DEFAULT_SEPARATORS).unwrap();
        assert_eq!(t.prefix_tokens[1], ab.token());
    }

    #[test]
    fn exact_match_single_topic() {
        let m = matcher();
        let sub = vec![topics(&m, &["a.b"])];
        let pub_filter = m.build_filter(&topics(&m, &["a.b", "c"]));
        assert!(m.matches(&sub, &pub_filter));

        let other = m.build_filter(&topics(&m, &["c"]));
        assert!(!m.matches(&sub, &other));
    }

    #[test]
    fn prefix_match_deeper_publication() {
        let m = matcher();
        let sub = vec![topics(&m, &["a.b"])];
        let deeper = m.build_filter(&topics(&m, &["a.b.c"]));
        assert!(m.matches(&sub, &deeper));
        // The reverse does not hold: sub a.b.c vs pub a.b.
        let deep_sub = vec![topics(&m, &["a.b.c"])];
        let shallow = m.build_filter(&topics(&m, &["a.b"]));
        assert!(!m.matches(&deep_sub, &shallow));
    }

    #[test]
    fn exact_mode_ignores_prefixes() {
        let m = TopicMatcher::new(FilterParams::default(), DEFAULT_SEPARATORS, false);
        let sub = vec![topics(&m, &["a.b"])];
        let deeper = m.build_filter(&topics(&m, &["a.b.c"]));
        assert!(!m.matches(&sub, &deeper));
        let same = m.build_filter(&topics(&m, &["a.b"]));
        assert!(m.matches(&sub, &same));
    }

    #[test]
    fn and_combination_within_group() {
        let m = matcher();
        let sub = vec![topics(&m, &["red", "green"])];
        let both = m.build_filter(&topics(&m, &["red", "green", "blue"]));
        let one = m.build_filter(&topics(&m, &["red"]));
        assert!(m.matches(&sub, &both));
        assert!(!m.matches(&sub, &one));
    }

    #[test]
    fn or_groups_match_independently() {
        let m = matcher();
        // (g1a AND g1b) OR (g2a)
        let sub = vec![topics(&m, &["g1a", "g1b"]), topics(&m, &["g2a"])];
        assert!(m.matches(&sub, &m.build_filter(&topics(&m, &["g1a", "g1b"]))));
        assert!(m.matches(&sub, &m.build_filter(&topics(&m, &["g2a"]))));
        assert!(!m.matches(&sub, &m.build_filter(&topics(&m, &["g1a"]))));
    }

    #[test]
    fn split_groups_at_marker() {
        let names: Vec<String> = ["g1a", "g1b", "|", "g2a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let groups = TopicMatcher::split_groups(&names);
        assert_eq!(groups, vec![vec!["g1a", "g1b"], vec!["g2a"]]);

        // Leading, trailing, doubled markers produce no empty groups.
        let odd: Vec<String> = ["|", "a", "|", "|", "b", "|"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(TopicMatcher::split_groups(&odd), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn interest_filter_admits_matching_publication() {
        let m = matcher();
        let interests = m.interest_filter(&[topics(&m, &["a.b"])]);
        let pub_filter = m.build_filter(&topics(&m, &["a.b.c"]));
        // Forwarding admission: interest token is among the publication's
        // prefix tokens, so the filters overlap.
        assert!(interests.intersects(&pub_filter));
    }

    #[test]
    fn empty_subscription_never_matches() {
        let m = matcher();
        let pub_filter = m.build_filter(&topics(&m, &["a"]));
        assert!(!m.matches(&[], &pub_filter));
        assert!(!m.matches(&[vec![]], &pub_filter));
    }
}
