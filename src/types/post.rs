//! Post pointers and reference aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::account::AccountId;

/// Post identifier (status URI or AT URI).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub String);

impl PostId {
    /// Create a post id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Full post body, owned by the post-content collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post id.
    pub id: PostId,
    /// Author.
    pub author: AccountId,
    /// Text content.
    pub text: String,
    /// Publication time.
    pub posted_at: DateTime<Utc>,
    /// Quoted/embedded post, if any.
    pub embedded_post_id: Option<PostId>,
    /// Direct parent when this is a reply.
    pub parent_post_id: Option<PostId>,
    /// Thread root when this is a reply.
    pub root_post_id: Option<PostId>,
}

impl Post {
    /// Ids of posts this one points at (embedded, parent, root).
    pub fn related_ids(&self) -> impl Iterator<Item = &PostId> {
        self.embedded_post_id
            .iter()
            .chain(self.parent_post_id.iter())
            .chain(self.root_post_id.iter())
    }
}

/// Lightweight pointer to a post that appeared in a group's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostIndex {
    /// Post id.
    pub post_id: PostId,
    /// Publication time.
    pub posted_at: DateTime<Utc>,
    /// Author (or reposting account for reposts).
    pub posted_by: AccountId,
    /// Original post when this entry is a repost.
    pub reposted_post_id: Option<PostId>,
}

/// Interaction kinds tracked per post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Quote post.
    Quote,
    /// Reply.
    Reply,
    /// Repost/boost.
    Repost,
    /// Like/favourite.
    Like,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quote => write!(f, "quote"),
            Self::Reply => write!(f, "reply"),
            Self::Repost => write!(f, "repost"),
            Self::Like => write!(f, "like"),
        }
    }
}

/// Quote/reply/repost/like counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCounts {
    /// Quote count.
    pub quote: u32,
    /// Reply count.
    pub reply: u32,
    /// Repost count.
    pub repost: u32,
    /// Like count.
    pub like: u32,
}

impl ReferenceCounts {
    /// Increment the counter for `kind`.
    pub fn bump(&mut self, kind: ReferenceKind) {
        match kind {
            ReferenceKind::Quote => self.quote = self.quote.saturating_add(1),
            ReferenceKind::Reply => self.reply = self.reply.saturating_add(1),
            ReferenceKind::Repost => self.repost = self.repost.saturating_add(1),
            ReferenceKind::Like => self.like = self.like.saturating_add(1),
        }
    }

    /// Element-wise sum, saturating at `u32::MAX`.
    pub fn merge(&mut self, other: &ReferenceCounts) {
        self.quote = self.quote.saturating_add(other.quote);
        self.reply = self.reply.saturating_add(other.reply);
        self.repost = self.repost.saturating_add(other.repost);
        self.like = self.like.saturating_add(other.like);
    }

    /// Sum of all counters, saturating at `u32::MAX`.
    pub fn total(&self) -> u32 {
        self.quote
            .saturating_add(self.reply)
            .saturating_add(self.repost)
            .saturating_add(self.like)
    }
}

/// Per-post interaction aggregate for one bucket (or a merge of buckets).
///
/// Only member-originated references keep the referring ids; neighbor
/// references are counted but not itemized. Detail lists are kept sorted
/// by id so membership checks are a binary search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceIndex {
    /// Referenced post.
    pub post_id: PostId,
    /// Counts attributed to group members.
    pub member: ReferenceCounts,
    /// Counts attributed to neighbors.
    pub neighbor: ReferenceCounts,
    /// Member posts quoting this post.
    #[serde(default)]
    pub quoted_by: Vec<PostId>,
    /// Member posts replying to this post.
    #[serde(default)]
    pub replied_by: Vec<PostId>,
    /// Member accounts reposting this post.
    #[serde(default)]
    pub reposted_by: Vec<AccountId>,
}

impl ReferenceIndex {
    /// Empty aggregate for a post.
    pub fn new(post_id: PostId) -> Self {
        Self {
            post_id,
            member: ReferenceCounts::default(),
            neighbor: ReferenceCounts::default(),
            quoted_by: Vec::new(),
            replied_by: Vec::new(),
            reposted_by: Vec::new(),
        }
    }

    /// Add a member quote. Returns `false` if `post` was already listed.
    pub fn add_quote(&mut self, post: &PostId) -> bool {
        insert_sorted(&mut self.quoted_by, post)
    }

    /// Add a member reply. Returns `false` if `post` was already listed.
    pub fn add_reply(&mut self, post: &PostId) -> bool {
        insert_sorted(&mut self.replied_by, post)
    }

    /// Add a member repost. Returns `false` if `actor` was already listed.
    pub fn add_repost(&mut self, actor: &AccountId) -> bool {
        insert_sorted(&mut self.reposted_by, actor)
    }

    /// Fold another aggregate for the same post into this one.
    pub fn merge(&mut self, other: &ReferenceIndex) {
        self.member.merge(&other.member);
        self.neighbor.merge(&other.neighbor);
        union_sorted(&mut self.quoted_by, &other.quoted_by);
        union_sorted(&mut self.replied_by, &other.replied_by);
        union_sorted(&mut self.reposted_by, &other.reposted_by);
    }
}

fn insert_sorted<T: Ord + Clone>(into: &mut Vec<T>, item: &T) -> bool {
    match into.binary_search(item) {
        Ok(_) => false,
        Err(at) => {
            into.insert(at, item.clone());
            true
        }
    }
}

// Linear merge of two sorted lists. Unsorted input (hand-built or from an
// older row) is sorted first.
fn union_sorted<T: Ord + Clone>(into: &mut Vec<T>, from: &[T]) {
    if from.is_empty() {
        return;
    }
    let mut incoming = from.to_vec();
    incoming.sort();
    incoming.dedup();
    let mut current = std::mem::take(into);
    current.sort();
    current.dedup();

    let mut merged = Vec::with_capacity(current.len() + incoming.len());
    let mut left = current.into_iter().peekable();
    let mut right = incoming.into_iter().peekable();
    loop {
        let order = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        let next = match order {
            Ordering::Less => left.next(),
            Ordering::Greater => right.next(),
            Ordering::Equal => {
                right.next();
                left.next()
            }
        };
        merged.extend(next);
    }
    *into = merged;
}

/// A ranked post with its score, aggregate and resolved bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPost {
    /// Ranking score.
    pub score: f64,
    /// Merged reference aggregate.
    pub references: ReferenceIndex,
    /// Post body.
    pub post: Post,
    /// Embedded (quoted) post body, if resolvable.
    pub embedded: Option<Post>,
    /// Parent post body, if resolvable.
    pub parent: Option<Post>,
    /// Thread root body, if resolvable.
    pub root: Option<Post>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_bump_and_merge() {
        let mut a = ReferenceCounts::default();
        a.bump(ReferenceKind::Quote);
        a.bump(ReferenceKind::Quote);
        let mut b = ReferenceCounts::default();
        b.bump(ReferenceKind::Reply);

        a.merge(&b);
        assert_eq!(a, ReferenceCounts { quote: 2, reply: 1, repost: 0, like: 0 });
        assert_eq!(a.total(), 3);
    }

    #[test]
    fn test_reference_merge_keeps_detail_unique() {
        let mut a = ReferenceIndex::new(PostId::from("p"));
        a.quoted_by.push(PostId::from("q1"));
        let mut b = ReferenceIndex::new(PostId::from("p"));
        b.quoted_by.push(PostId::from("q1"));
        b.quoted_by.push(PostId::from("q2"));

        a.merge(&b);
        assert_eq!(a.quoted_by, vec![PostId::from("q1"), PostId::from("q2")]);
    }

    #[test]
    fn test_counts_saturate_instead_of_wrapping() {
        let mut a = ReferenceCounts { quote: u32::MAX, reply: 1, repost: 0, like: 0 };
        a.bump(ReferenceKind::Quote);
        assert_eq!(a.quote, u32::MAX);

        let b = ReferenceCounts { quote: 5, reply: u32::MAX, repost: 0, like: 0 };
        a.merge(&b);
        assert_eq!(a.quote, u32::MAX);
        assert_eq!(a.reply, u32::MAX);
        assert_eq!(a.total(), u32::MAX);
    }

    #[test]
    fn test_detail_lists_stay_sorted_and_unique() {
        let mut a = ReferenceIndex::new(PostId::from("p"));
        assert!(a.add_quote(&PostId::from("q3")));
        assert!(a.add_quote(&PostId::from("q1")));
        assert!(!a.add_quote(&PostId::from("q3")));

        let mut b = ReferenceIndex::new(PostId::from("p"));
        for id in ["q4", "q2", "q1"] {
            b.add_quote(&PostId::from(id));
        }

        a.merge(&b);
        let ids: Vec<&str> = a.quoted_by.iter().map(|p| p.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2", "q3", "q4"]);
    }

    #[test]
    fn test_large_detail_merge_is_deduplicated() {
        let mut a = ReferenceIndex::new(PostId::from("p"));
        let mut b = ReferenceIndex::new(PostId::from("p"));
        for i in 0..20_000 {
            a.add_reply(&PostId::new(format!("r{i:05}")));
            b.add_reply(&PostId::new(format!("r{:05}", i + 10_000)));
        }

        a.merge(&b);
        assert_eq!(a.replied_by.len(), 30_000);
        assert!(a.replied_by.windows(2).all(|w| w[0] < w[1]));
    }
}
