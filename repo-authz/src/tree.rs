//! Filtering the rule model down to one (user, repository) pair.
//!
//! The rules relevant to the pair are folded into a prefix tree over path
//! segments, one pattern per node. All nodes live in a flat arena owned by
//! the tree and reference each other by index, so the lookup state can keep
//! node lists across queries without borrowing into the tree, and dropping
//! the tree releases everything in one step.

use std::collections::HashMap;
use std::sync::Arc;

use crate::access::Access;
use crate::model::{AuthzModel, GlobSegment, Segment};

/// Marks rights that no rule produced.
pub(crate) const NO_SEQUENCE_NUMBER: i32 = -1;

/// Rights a single rule grants, tagged with the rule's position.
#[derive(Clone, Copy)]
pub(crate) struct RuleAccess {
    /// Position of the originating rule. Later rules beat earlier ones when
    /// more than one covers a path; 0 is the implicit root default and
    /// [`NO_SEQUENCE_NUMBER`] means "no rule".
    pub sequence_number: i32,
    pub rights: Access,
}

impl RuleAccess {
    pub(crate) const NO_RULE: RuleAccess = RuleAccess {
        sequence_number: NO_SEQUENCE_NUMBER,
        rights: Access::empty(),
    };
}

/// Node-local rights combined with the rights bounds over the subtree.
#[derive(Clone, Copy)]
pub(crate) struct LimitedRights {
    /// Rights of the rule ending at this node, if any.
    pub access: RuleAccess,
    /// Lower bound of the rights granted anywhere in the subtree.
    pub min_rights: Access,
    /// Upper bound of the rights granted anywhere in the subtree.
    pub max_rights: Access,
}

impl LimitedRights {
    pub(crate) const NONE: LimitedRights = LimitedRights {
        access: RuleAccess::NO_RULE,
        min_rights: Access::empty(),
        max_rights: Access::empty(),
    };

    pub(crate) fn has_local_rule(&self) -> bool {
        self.access.sequence_number != NO_SEQUENCE_NUMBER
    }

    /// Of two applicable rules, keep the later one.
    pub(crate) fn combine_access(&mut self, other: &LimitedRights) {
        if self.access.sequence_number < other.access.sequence_number {
            self.access = other.access;
        }
    }

    /// Aggregate the subtree bounds of `other` into ours.
    pub(crate) fn combine_limits(&mut self, other: &LimitedRights) {
        self.max_rights |= other.max_rights;
        self.min_rights &= other.min_rights;
    }
}

/// Index of a node in its tree's arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The root node of every tree.
pub(crate) const ROOT: NodeId = NodeId(0);

/// Sub-nodes reached through wildcard patterns rather than literal segments.
/// Kept out of [`Node`] so the common all-literal case pays one pointer.
#[derive(Default)]
pub(crate) struct NodePatterns {
    /// The `*` child, if any.
    pub any: Option<NodeId>,
    /// The `**` child, if any.
    pub any_var: Option<NodeId>,
    /// `text*` children, sorted by the prefix literal.
    pub prefixes: Vec<NodeId>,
    /// `*text` children, sorted by the reversed suffix literal.
    pub suffixes: Vec<NodeId>,
    /// Remaining wildcard children, sorted by pattern text.
    pub complex: Vec<NodeId>,
    /// The node itself is a `**` pattern and applies on the next level again.
    pub repeat: bool,
}

pub(crate) struct Node {
    /// The pattern text matched at this node's depth, empty at the root.
    /// Suffix nodes store the reversed literal.
    pub segment: Arc<str>,
    pub rights: LimitedRights,
    /// Matcher for nodes in the `complex` list.
    pub glob: Option<GlobSegment>,
    /// Literal children by segment text.
    pub sub_nodes: HashMap<Arc<str>, NodeId>,
    /// Wildcard children.
    pub patterns: Option<Box<NodePatterns>>,
}

#[derive(Clone, Copy)]
enum PatternList {
    Prefixes,
    Suffixes,
    Complex,
}

/// The filtered rule tree for one (user, repository) pair.
pub(crate) struct RuleTree {
    nodes: Vec<Node>,
}

impl RuleTree {
    /// Filter `model` down to the rules relevant for `user` on `repos`, fold
    /// them into a new tree and compute the subtree rights bounds.
    pub fn build(model: &AuthzModel, repos: &str, user: Option<&str>) -> RuleTree {
        let mut tree = RuleTree { nodes: Vec::new() };
        tree.new_node(Arc::from(""), None);

        // (segment, node) trail of the previous insertion. Authz files tend
        // to keep related rules adjacent, so the common prefix is usually
        // walkable by identity comparison alone.
        let mut cursor: Vec<(&Segment, NodeId)> = Vec::new();

        for acl in model.acls() {
            let Some(rights) = model.access(acl, repos, user) else {
                continue;
            };
            let access = RuleAccess {
                sequence_number: acl.sequence_number,
                rights,
            };

            let mut depth = 0;
            let mut node = ROOT;
            while depth < cursor.len()
                && depth < acl.path.len()
                && cursor[depth].0.same_pattern(&acl.path[depth])
            {
                node = cursor[depth].1;
                depth += 1;
            }
            cursor.truncate(depth);

            for segment in &acl.path[depth..] {
                node = tree.insert_segment(node, segment);
                cursor.push((segment, node));
            }

            // A later section that normalizes to the same tree path wins.
            if tree.nodes[node.index()].rights.access.sequence_number < access.sequence_number {
                tree.nodes[node.index()].rights.access = access;
            }
        }

        // Paths that no rule covers resolve against the root default.
        if !tree.nodes[ROOT.index()].rights.has_local_rule() {
            tree.nodes[ROOT.index()].rights.access = RuleAccess {
                sequence_number: 0,
                rights: Access::empty(),
            };
        }

        let inherited = tree.nodes[ROOT.index()].rights.access;
        tree.finalize_up(ROOT, inherited);
        tree.finalize_down(
            ROOT,
            LimitedRights {
                access: RuleAccess::NO_RULE,
                min_rights: Access::OPERATIONS,
                max_rights: Access::empty(),
            },
        );

        tree
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn root(&self) -> &Node {
        self.node(ROOT)
    }

    fn new_node(&mut self, segment: Arc<str>, glob: Option<GlobSegment>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            segment,
            rights: LimitedRights::NONE,
            glob,
            sub_nodes: HashMap::new(),
            patterns: None,
        });
        id
    }

    fn patterns_mut(&mut self, id: NodeId) -> &mut NodePatterns {
        self.nodes[id.index()].patterns.get_or_insert_with(Default::default)
    }

    /// Get or create the child of `parent` for `segment`, routed to the
    /// sub-structure matching the pattern kind.
    fn insert_segment(&mut self, parent: NodeId, segment: &Segment) -> NodeId {
        match segment {
            Segment::Literal(text) => {
                if let Some(&child) = self.nodes[parent.index()].sub_nodes.get(text.as_ref()) {
                    return child;
                }
                let child = self.new_node(text.clone(), None);
                self.nodes[parent.index()].sub_nodes.insert(text.clone(), child);
                child
            }
            Segment::AnySegment => {
                if let Some(child) = self.patterns_mut(parent).any {
                    return child;
                }
                let child = self.new_node(Arc::from("*"), None);
                self.patterns_mut(parent).any = Some(child);
                child
            }
            Segment::AnyRecursive => {
                if let Some(child) = self.patterns_mut(parent).any_var {
                    return child;
                }
                let child = self.new_node(Arc::from("**"), None);
                self.patterns_mut(parent).any_var = Some(child);
                // a '**' node re-applies itself on every following level
                self.patterns_mut(child).repeat = true;
                child
            }
            Segment::Prefix(text) => self.insert_sorted(parent, text, None, PatternList::Prefixes),
            Segment::Suffix(text) => self.insert_sorted(parent, text, None, PatternList::Suffixes),
            Segment::Fnmatch(glob) => {
                self.insert_sorted(parent, glob.pattern(), Some(glob.clone()), PatternList::Complex)
            }
        }
    }

    /// Get or create the entry for `text` in one of the sorted pattern
    /// arrays of `parent`.
    fn insert_sorted(
        &mut self,
        parent: NodeId,
        text: &Arc<str>,
        glob: Option<GlobSegment>,
        which: PatternList,
    ) -> NodeId {
        let position = {
            let list = Self::pattern_list(&self.nodes[parent.index()], which);
            match list
                .binary_search_by(|id| self.nodes[id.index()].segment.as_ref().cmp(text.as_ref()))
            {
                Ok(found) => return list[found],
                Err(position) => position,
            }
        };

        let child = self.new_node(text.clone(), glob);
        let patterns = self.patterns_mut(parent);
        let list = match which {
            PatternList::Prefixes => &mut patterns.prefixes,
            PatternList::Suffixes => &mut patterns.suffixes,
            PatternList::Complex => &mut patterns.complex,
        };
        list.insert(position, child);
        child
    }

    fn pattern_list(node: &Node, which: PatternList) -> &[NodeId] {
        match &node.patterns {
            None => &[],
            Some(patterns) => match which {
                PatternList::Prefixes => &patterns.prefixes,
                PatternList::Suffixes => &patterns.suffixes,
                PatternList::Complex => &patterns.complex,
            },
        }
    }

    /// All children of `id`, across the literal map and every pattern slot.
    fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id.index()];
        let mut children: Vec<NodeId> = node.sub_nodes.values().copied().collect();
        if let Some(patterns) = &node.patterns {
            children.extend(patterns.any);
            children.extend(patterns.any_var);
            children.extend_from_slice(&patterns.prefixes);
            children.extend_from_slice(&patterns.suffixes);
            children.extend_from_slice(&patterns.complex);
        }
        children
    }

    /// Bottom-up pass: seed every node's bounds with its effective local
    /// rights (its own rule, or the nearest ancestor rule otherwise) and
    /// fold the children's bounds into their parents.
    fn finalize_up(&mut self, id: NodeId, inherited: RuleAccess) {
        let access = if self.nodes[id.index()].rights.has_local_rule() {
            self.nodes[id.index()].rights.access
        } else {
            inherited
        };
        self.nodes[id.index()].rights.min_rights = access.rights;
        self.nodes[id.index()].rights.max_rights = access.rights;

        for child in self.child_ids(id) {
            self.finalize_up(child, access);
            let limits = self.nodes[child.index()].rights;
            self.nodes[id.index()].rights.combine_limits(&limits);
        }
    }

    /// Top-down pass: a `**` rule matches zero or more segments and thereby
    /// repeats on every level below its node, so its bounds widen the
    /// subtree bounds of everything underneath.
    fn finalize_down(&mut self, id: NodeId, mut inherited: LimitedRights) {
        self.nodes[id.index()].rights.combine_limits(&inherited);

        if let Some(any_var) = self.nodes[id.index()]
            .patterns
            .as_ref()
            .and_then(|patterns| patterns.any_var)
        {
            let limits = self.nodes[any_var.index()].rights;
            inherited.combine_limits(&limits);
        }

        for child in self.child_ids(id) {
            self.finalize_down(child, inherited);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::AuthzModel;

    use anyhow::Error;

    fn tree_for(rules: &str, repos: &str, user: Option<&str>) -> Result<RuleTree, Error> {
        let model = AuthzModel::parse(rules)?;
        Ok(RuleTree::build(&model, repos, user))
    }

    fn literal_child(tree: &RuleTree, id: NodeId, segment: &str) -> NodeId {
        *tree
            .node(id)
            .sub_nodes
            .get(segment)
            .unwrap_or_else(|| panic!("missing literal child '{segment}'"))
    }

    #[test]
    fn test_implicit_root_default() -> Result<(), Error> {
        let tree = tree_for("[/trunk]\nalice = rw\n", "repo", Some("bob"))?;

        // nothing applies to bob, only the implicit default remains
        assert_eq!(tree.root().rights.access.sequence_number, 0);
        assert_eq!(tree.root().rights.access.rights, Access::empty());
        assert!(tree.root().sub_nodes.is_empty());
        assert!(tree.root().patterns.is_none());

        Ok(())
    }

    #[test]
    fn test_filtering_keeps_relevant_rules() -> Result<(), Error> {
        let rules = "\
            [/trunk]\n\
            alice = rw\n\
            [otherrepo:/tags]\n\
            alice = r\n\
            [/branches]\n\
            bob = r\n\
            ";
        let tree = tree_for(rules, "repo", Some("alice"))?;

        assert_eq!(tree.root().sub_nodes.len(), 1);
        let trunk = literal_child(&tree, ROOT, "trunk");
        assert_eq!(tree.node(trunk).rights.access.sequence_number, 1);
        assert_eq!(tree.node(trunk).rights.access.rights, Access::OPERATIONS);

        Ok(())
    }

    #[test]
    fn test_later_rule_wins_on_collision() -> Result<(), Error> {
        let rules = "\
            [/data]\n\
            alice = rw\n\
            [/data]\n\
            alice = r\n\
            ";
        let tree = tree_for(rules, "repo", Some("alice"))?;

        let data = literal_child(&tree, ROOT, "data");
        assert_eq!(tree.node(data).rights.access.sequence_number, 2);
        assert_eq!(tree.node(data).rights.access.rights, Access::READ);

        Ok(())
    }

    #[test]
    fn test_shared_prefixes_share_nodes() -> Result<(), Error> {
        let rules = "\
            [/trunk/src/core]\n\
            alice = rw\n\
            [/trunk/src/util]\n\
            alice = r\n\
            [/trunk/doc]\n\
            alice = r\n\
            ";
        let tree = tree_for(rules, "repo", Some("alice"))?;

        let trunk = literal_child(&tree, ROOT, "trunk");
        let src = literal_child(&tree, trunk, "src");
        assert_eq!(tree.root().sub_nodes.len(), 1);
        assert_eq!(tree.node(trunk).sub_nodes.len(), 2);
        assert_eq!(tree.node(src).sub_nodes.len(), 2);

        // intermediate nodes carry no rule of their own
        assert!(!tree.node(trunk).rights.has_local_rule());
        assert!(tree.node(src).sub_nodes.contains_key("core"));

        Ok(())
    }

    #[test]
    fn test_min_max_bounds() -> Result<(), Error> {
        let rules = "\
            [/]\n\
            alice = r\n\
            [/secret]\n\
            alice =\n\
            [/public]\n\
            alice = rw\n\
            ";
        let tree = tree_for(rules, "repo", Some("alice"))?;

        assert_eq!(tree.root().rights.min_rights, Access::empty());
        assert_eq!(tree.root().rights.max_rights, Access::OPERATIONS);

        let secret = literal_child(&tree, ROOT, "secret");
        assert_eq!(tree.node(secret).rights.min_rights, Access::empty());
        assert_eq!(tree.node(secret).rights.max_rights, Access::empty());

        let public = literal_child(&tree, ROOT, "public");
        assert_eq!(tree.node(public).rights.min_rights, Access::OPERATIONS);
        assert_eq!(tree.node(public).rights.max_rights, Access::OPERATIONS);

        Ok(())
    }

    #[test]
    fn test_recursive_rule_limits_descendants() -> Result<(), Error> {
        let rules = "\
            [/]\n\
            alice = rw\n\
            [/**/tmp]\n\
            alice =\n\
            ";
        let tree = tree_for(rules, "repo", Some("alice"))?;

        // the '**' rule may strike anywhere below the root, no node can
        // promise more than "maybe nothing"
        assert_eq!(tree.root().rights.min_rights, Access::empty());
        assert_eq!(tree.root().rights.max_rights, Access::OPERATIONS);

        let patterns = tree.root().patterns.as_ref().expect("missing pattern sub-nodes");
        let any_var = patterns.any_var.expect("missing '**' child");
        assert!(tree.node(any_var).patterns.as_ref().is_some_and(|p| p.repeat));
        assert_eq!(tree.node(any_var).rights.min_rights, Access::empty());

        Ok(())
    }

    #[test]
    fn test_sorted_pattern_lists() -> Result<(), Error> {
        let rules = "\
            [/lib*]\n\
            alice = r\n\
            [/bin*]\n\
            alice = r\n\
            [/core*]\n\
            alice = r\n\
            ";
        let tree = tree_for(rules, "repo", Some("alice"))?;

        let patterns = tree.root().patterns.as_ref().expect("missing pattern sub-nodes");
        let stored: Vec<&str> = patterns
            .prefixes
            .iter()
            .map(|&id| tree.node(id).segment.as_ref())
            .collect();
        assert_eq!(stored, ["bin", "core", "lib"]);

        Ok(())
    }
}
