//! Path-based authorization over repository paths.
//!
//! A parsed [`AuthzModel`] holds the global rule set: ordered rule sections
//! binding (principal, repository, path pattern) triples to access rights.
//! An [`Authz`] instance answers queries of the form "does user U hold
//! access A on path P of repository R", optionally for every potential path
//! below P at once.
//!
//! Per (user, repository) pair the global rules are filtered into a prefix
//! tree over path segments and cached; queries then walk that tree segment
//! by segment, with precomputed subtree rights bounds cutting most walks
//! short.
//!
//! The model is immutable and can be shared between instances. An instance
//! mutates its cache and lookup states on every query, so it wants one owner
//! per worker (or external locking).

mod access;
mod cache;
mod lookup;
mod model;
mod parse;
mod tree;

pub use access::Access;
pub use model::{Acl, AclEntry, AuthzModel, GlobSegment, Principal, Segment, ANY_REPOSITORY};
pub use parse::parse;

use std::sync::Arc;

use anyhow::{bail, Error};

use cache::UserRulesCache;

/// An authorization instance: a shared rule model plus the per-(user,
/// repository) filtered trees derived from it.
pub struct Authz {
    model: Arc<AuthzModel>,
    cache: UserRulesCache,
}

impl Authz {
    pub fn new(model: Arc<AuthzModel>) -> Self {
        Authz {
            model,
            cache: UserRulesCache::new(),
        }
    }

    /// Parse `rules` and build an instance around the resulting model.
    pub fn from_raw(rules: &str) -> Result<Self, Error> {
        Ok(Self::new(Arc::new(AuthzModel::parse(rules)?)))
    }

    /// The shared rule model.
    pub fn model(&self) -> &Arc<AuthzModel> {
        &self.model
    }

    /// Check whether `user` (`None` for the anonymous user) holds the
    /// `required` access on `path` of repository `repos`.
    ///
    /// With `repos` set to `None`, only rules that are not bound to a
    /// specific repository apply. With `path` set to `None` the question
    /// becomes "does the user hold the required access anywhere in the
    /// repository". A given path must be absolute, but does not need to be
    /// normalized; a trailing separator queries the empty segment below the
    /// named path.
    ///
    /// [`Access::RECURSIVE`] in `required` demands the remaining bits on
    /// every potential path below `path` as well, whether or not those paths
    /// currently exist.
    pub fn check_access(
        &mut self,
        repos: Option<&str>,
        path: Option<&str>,
        user: Option<&str>,
        required: Access,
    ) -> Result<bool, Error> {
        let repos = repos.unwrap_or(ANY_REPOSITORY);
        let rules = self.cache.entry(&self.model, repos, user);

        let recursive = required.contains(Access::RECURSIVE);
        let required = required - Access::RECURSIVE;

        let Some(path) = path else {
            return Ok(rules.tree.root().rights.max_rights.contains(required));
        };

        if !path.starts_with('/') {
            bail!("query path '{path}' is not absolute");
        }

        Ok(lookup::lookup(
            &mut rules.lookup,
            &rules.tree,
            path,
            required,
            recursive,
        ))
    }
}
