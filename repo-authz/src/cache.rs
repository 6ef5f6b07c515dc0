//! Per-(user, repository) cache of filtered rule trees.

use crate::lookup::LookupState;
use crate::model::AuthzModel;
use crate::tree::RuleTree;

/// How many (user, repository) pairs are kept filtered at any one time.
const FILTERED_CACHE_SIZE: usize = 8;

/// One cached filtered tree together with the lookup state walking it.
pub(crate) struct UserRules {
    /// User the tree was filtered for, `None` for the anonymous user.
    user: Option<String>,
    repos: String,
    pub tree: RuleTree,
    pub lookup: LookupState,
}

/// Fixed-size LRU of filtered trees, most recently used first.
pub(crate) struct UserRulesCache {
    entries: Vec<UserRules>,
}

impl UserRulesCache {
    pub fn new() -> Self {
        UserRulesCache {
            entries: Vec::with_capacity(FILTERED_CACHE_SIZE),
        }
    }

    /// Fetch the entry for `user` on `repos`, building it on a miss.
    ///
    /// The entry is promoted to the front; on a miss with a full cache the
    /// oldest entry is dropped first, which releases its tree arena and
    /// lookup state in one step.
    pub fn entry(
        &mut self,
        model: &AuthzModel,
        repos: &str,
        user: Option<&str>,
    ) -> &mut UserRules {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.user.as_deref() == user && entry.repos == repos);

        match position {
            Some(position) => self.entries[..=position].rotate_right(1),
            None => {
                if self.entries.len() == FILTERED_CACHE_SIZE {
                    self.entries.pop();
                }
                log::debug!("filtering rules for user {user:?} on repository {repos:?}");
                self.entries.insert(
                    0,
                    UserRules {
                        user: user.map(str::to_owned),
                        repos: repos.to_owned(),
                        tree: RuleTree::build(model, repos, user),
                        lookup: LookupState::new(),
                    },
                );
            }
        }

        &mut self.entries[0]
    }
}
