//! The parsed authorization rule model.
//!
//! Produced once by [`parse`](crate::parse::parse) and treated as immutable
//! by the filtering and lookup machinery. All literal strings are interned,
//! so pattern data of equal text is always the same allocation and can be
//! compared by pointer identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Error};
use globset::{Glob, GlobMatcher};

use crate::access::Access;

/// Sentinel repository name for rules that are not bound to a specific
/// repository. Queries that do not name a repository filter against this
/// sentinel and therefore only see such rules.
pub const ANY_REPOSITORY: &str = "";

/// A general wildcard segment, compiled once and shared by every filtered
/// tree derived from the model.
#[derive(Clone, Debug)]
pub struct GlobSegment {
    pattern: Arc<str>,
    matcher: Arc<GlobMatcher>,
}

impl GlobSegment {
    pub(crate) fn new(pattern: Arc<str>) -> Result<Self, Error> {
        let matcher = Glob::new(&pattern)
            .with_context(|| format!("invalid wildcard pattern '{pattern}'"))?
            .compile_matcher();

        Ok(Self {
            pattern,
            matcher: Arc::new(matcher),
        })
    }

    /// The pattern text as written in the rule path.
    pub fn pattern(&self) -> &Arc<str> {
        &self.pattern
    }

    /// Test a single path segment against the pattern.
    pub fn matches(&self, segment: &str) -> bool {
        self.matcher.is_match(segment)
    }
}

/// One component of a rule path.
#[derive(Clone, Debug)]
pub enum Segment {
    /// Matches exactly this segment.
    Literal(Arc<str>),
    /// `*`, matches any single segment.
    AnySegment,
    /// `**`, matches any sequence of zero or more segments.
    AnyRecursive,
    /// `text*`, matches segments starting with the stored literal.
    Prefix(Arc<str>),
    /// `*text`, matches segments ending in the suffix. The stored literal is
    /// the suffix *reversed*, so matching can run as a prefix test on a
    /// reversed segment.
    Suffix(Arc<str>),
    /// Any other pattern containing wildcards, matched as a glob.
    Fnmatch(GlobSegment),
}

impl Segment {
    /// Whether two segments are the same parsed pattern.
    ///
    /// Pattern data is interned, comparing by pointer identity is exact.
    pub(crate) fn same_pattern(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Literal(a), Segment::Literal(b)) => Arc::ptr_eq(a, b),
            (Segment::AnySegment, Segment::AnySegment) => true,
            (Segment::AnyRecursive, Segment::AnyRecursive) => true,
            (Segment::Prefix(a), Segment::Prefix(b)) => Arc::ptr_eq(a, b),
            (Segment::Suffix(a), Segment::Suffix(b)) => Arc::ptr_eq(a, b),
            (Segment::Fnmatch(a), Segment::Fnmatch(b)) => Arc::ptr_eq(&a.pattern, &b.pattern),
            _ => false,
        }
    }
}

/// Who a rule entry applies to.
#[derive(Clone, Debug)]
pub enum Principal {
    /// A single named user.
    User(Arc<str>),
    /// All members of a named group.
    Group(Arc<str>),
    /// `*`, everyone, authenticated or not.
    Everyone,
    /// `$anonymous`, unauthenticated users only.
    Anonymous,
    /// `$authenticated`, authenticated users only.
    Authenticated,
}

/// One `principal = rights` line of a rule section.
#[derive(Clone, Debug)]
pub struct AclEntry {
    pub principal: Principal,
    pub rights: Access,
}

/// One parsed rule section.
#[derive(Debug)]
pub struct Acl {
    /// 1-based position of the section in the configuration. Where several
    /// rules end up covering the same path, the highest number wins.
    pub sequence_number: i32,
    /// Repository this rule is bound to, [`ANY_REPOSITORY`] if none.
    pub repos: Arc<str>,
    /// The rule path, one pattern per segment. Empty for the root rule.
    pub path: Vec<Segment>,
    /// The per-principal rights, in source order.
    pub entries: Vec<AclEntry>,
}

/// The full parsed authorization configuration.
///
/// Immutable after parsing. Wrap it in an [`Arc`] to share it between
/// authorization instances.
#[derive(Debug)]
pub struct AuthzModel {
    pub(crate) acls: Vec<Acl>,
    /// Group name to the flattened set of member user names.
    pub(crate) groups: HashMap<Arc<str>, HashSet<Arc<str>>>,
}

impl AuthzModel {
    /// Parse the authorization file format, see [`parse`](crate::parse::parse).
    pub fn parse(rules: &str) -> Result<Self, Error> {
        crate::parse::parse(rules)
    }

    /// The rules in source order.
    pub fn acls(&self) -> &[Acl] {
        &self.acls
    }

    /// Whether `user` is a member of `group`, after group expansion.
    pub fn is_group_member(&self, group: &str, user: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains(user))
    }

    /// The rights `acl` grants to `user` (`None` for the anonymous user) on
    /// repository `repos`.
    ///
    /// `None` means the rule has nothing to say about this user and
    /// repository. `Some(Access::empty())` is a real answer, it revokes
    /// whatever a covering rule granted.
    pub fn access(&self, acl: &Acl, repos: &str, user: Option<&str>) -> Option<Access> {
        if acl.repos.as_ref() != ANY_REPOSITORY && acl.repos.as_ref() != repos {
            return None;
        }

        let mut rights = Access::empty();
        let mut applies = false;

        for entry in &acl.entries {
            let matches = match &entry.principal {
                Principal::User(name) => user == Some(name.as_ref()),
                Principal::Group(name) => {
                    user.is_some_and(|user| self.is_group_member(name, user))
                }
                Principal::Everyone => true,
                Principal::Anonymous => user.is_none(),
                Principal::Authenticated => user.is_some(),
            };
            if matches {
                applies = true;
                rights |= entry.rights;
            }
        }

        applies.then_some(rights)
    }
}
