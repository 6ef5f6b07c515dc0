//! Walking a filtered rule tree along a query path.

use crate::access::Access;
use crate::tree::{LimitedRights, NodeId, RuleAccess, RuleTree, ROOT};

/// Reusable walk state for one filtered tree.
///
/// Lives next to its tree in the cache entry. Between queries it remembers
/// the node lists and rights of the last fully walked parent path, so
/// consecutive queries below a common parent skip re-walking the shared
/// prefix.
pub(crate) struct LookupState {
    /// Nodes tracking the query at the current depth.
    current: Vec<NodeId>,
    /// Nodes collected for the next depth.
    next: Vec<NodeId>,
    /// Rights accumulated at the current depth.
    rights: LimitedRights,
    /// The canonicalized path that `current` and `parent_rights` apply to.
    parent_path: String,
    /// Rights at `parent_path`.
    parent_rights: LimitedRights,
    /// Buffer for reversing segments during suffix matching.
    scratch: String,
}

impl LookupState {
    pub fn new() -> Self {
        LookupState {
            current: Vec::new(),
            next: Vec::new(),
            rights: LimitedRights::NONE,
            parent_path: String::new(),
            parent_rights: LimitedRights::NONE,
            scratch: String::new(),
        }
    }

    /// Prepare for a walk of `path` and return the part of it that still
    /// has to be walked. If the previous walk ended one level above a
    /// prefix of `path`, the walk resumes from there with the node lists
    /// kept as they are.
    fn init<'a>(&mut self, tree: &RuleTree, path: &'a str) -> &'a str {
        if !self.parent_path.is_empty() {
            if let Some(rest) = path.strip_prefix(self.parent_path.as_str()) {
                if rest.starts_with('/') {
                    self.rights = self.parent_rights;
                    return rest;
                }
            }
        }

        self.rights = tree.root().rights;
        self.parent_rights = tree.root().rights;

        self.current.clear();
        self.next.clear();
        self.current.push(ROOT);

        // a '**' rule at the root also matches the empty segment sequence
        if let Some(any_var) = tree.root().patterns.as_ref().and_then(|p| p.any_var) {
            let limits = tree.node(any_var).rights;
            self.rights.combine_access(&limits);
            self.rights.combine_limits(&limits);
            self.current.push(any_var);
        }

        self.parent_path.clear();
        self.scratch.clear();

        path
    }
}

/// Split the next segment off `path`. The remainder is `None` when this was
/// the last segment; runs of separators collapse, and a trailing separator
/// yields one final empty segment.
fn next_segment(path: &str) -> (&str, Option<&str>) {
    match path.split_once('/') {
        Some((segment, rest)) => (segment, Some(rest.trim_start_matches('/'))),
        None => (path, None),
    }
}

/// Track `node` for the next depth and fold its rights into the current
/// accumulator. Its `**` child, if any, matches the empty segment sequence
/// and therefore joins immediately; rule normalization guarantees this does
/// not recurse further.
fn add_next(state: &mut LookupState, tree: &RuleTree, node: NodeId) {
    // among rules matching the same path, the latest one applies
    let limits = tree.node(node).rights;
    state.rights.combine_access(&limits);

    // any of the tracked nodes may turn out to match further down, so the
    // possible rights below here span all of their subtrees
    state.rights.combine_limits(&limits);
    state.next.push(node);

    if let Some(any_var) = tree.node(node).patterns.as_ref().and_then(|p| p.any_var) {
        let limits = tree.node(any_var).rights;
        state.rights.combine_access(&limits);
        state.rights.combine_limits(&limits);
        state.next.push(any_var);
    }
}

/// Add every node of `list` whose stored literal is a byte-prefix of
/// `segment`. The list is sorted, so nothing sorting after the segment
/// itself can match and the scan is bounded by a binary search.
fn add_prefix_matches(state: &mut LookupState, tree: &RuleTree, segment: &str, list: &[NodeId]) {
    let end = list.partition_point(|&id| tree.node(id).segment.as_ref() <= segment);
    for &id in &list[..end] {
        if segment.starts_with(tree.node(id).segment.as_ref()) {
            add_next(state, tree, id);
        }
    }
}

/// Follow `path` through the tree and decide whether `required` is granted.
///
/// `required` must not contain [`Access::RECURSIVE`]; `recursive` instead
/// requests that every potential path below `path` satisfies `required` as
/// well. `path` does not need to be normalized.
pub(crate) fn lookup(
    state: &mut LookupState,
    tree: &RuleTree,
    path: &str,
    required: Access,
    recursive: bool,
) -> bool {
    let remainder = state.init(tree, path);
    // leading separators belong to the segment walked before them
    let mut path = Some(remainder.trim_start_matches('/'));

    while let Some(rest) = path {
        if state.current.is_empty() {
            break;
        }

        // nothing in this subtree can grant more than max_rights ...
        if !state.rights.max_rights.contains(required) {
            return false;
        }
        // ... and nothing in it grants less than min_rights
        if state.rights.min_rights.contains(required) {
            return true;
        }

        let (segment, rest) = next_segment(rest);
        path = rest;

        state.next.clear();
        state.rights.access = RuleAccess::NO_RULE;
        state.rights.min_rights = Access::OPERATIONS;
        state.rights.max_rights = Access::empty();

        for index in 0..state.current.len() {
            let node = state.current[index];

            if let Some(&child) = tree.node(node).sub_nodes.get(segment) {
                add_next(state, tree, child);
            }

            if let Some(patterns) = &tree.node(node).patterns {
                if let Some(any) = patterns.any {
                    add_next(state, tree, any);
                }
                // a '**' node matches this segment and stays in play
                if patterns.repeat {
                    add_next(state, tree, node);
                }
                if !patterns.prefixes.is_empty() {
                    add_prefix_matches(state, tree, segment, &patterns.prefixes);
                }
                for &complex in &patterns.complex {
                    let matched = tree
                        .node(complex)
                        .glob
                        .as_ref()
                        .is_some_and(|glob| glob.matches(segment));
                    if matched {
                        add_next(state, tree, complex);
                    }
                }
                if !patterns.suffixes.is_empty() {
                    // suffixes are reversed prefixes
                    let mut reversed = std::mem::take(&mut state.scratch);
                    reversed.clear();
                    reversed.extend(segment.chars().rev());
                    add_prefix_matches(state, tree, &reversed, &patterns.suffixes);
                    state.scratch = reversed;
                }
            }
        }

        // If no rule applied to this segment directly, the parent's rule
        // covers at least the segment itself and possibly parts of its
        // subtree.
        if !state.rights.has_local_rule() {
            state.rights.access = state.parent_rights.access;
            state.rights.min_rights &= state.parent_rights.access.rights;
            state.rights.max_rights |= state.parent_rights.access.rights;
        }

        if path.is_some() {
            std::mem::swap(&mut state.current, &mut state.next);
            // parent_path, parent_rights and current stay in lockstep so the
            // next query can pick up from here
            state.parent_path.push('/');
            state.parent_path.push_str(segment);
            state.parent_rights = state.rights;
        }
    }

    // A recursive query demands that even the least privileged potential
    // sub-path has the required access; whether those paths exist in the
    // repository is not this engine's concern.
    if recursive {
        state.rights.min_rights.contains(required)
    } else {
        state.rights.access.rights.contains(required)
    }
}
