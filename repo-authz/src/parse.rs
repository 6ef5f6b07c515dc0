//! Parser for the authorization file format.
//!
//! The format is INI-style: an optional `[groups]` section defining named
//! user sets, followed by rule sections `[/path]` or `[repository:/path]`
//! whose entries are `principal = rights` lines. Rights are any combination
//! of `r` and `w`, an empty value revokes access. Principals are user names,
//! `@group`, `*`, `$anonymous` or `$authenticated`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Error};

use crate::access::Access;
use crate::model::{Acl, AclEntry, AuthzModel, GlobSegment, Principal, Segment, ANY_REPOSITORY};

/// Parse the given authorization rules into a model.
///
/// Every literal string of the result is interned: equal text is the same
/// allocation. The tree builder relies on this for its identity-based
/// fast paths.
pub fn parse(rules: &str) -> Result<AuthzModel, Error> {
    let mut parser = Parser::default();

    for (linenr, line) in rules.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Err(err) = parser.parse_line(line) {
            bail!("unable to parse authz rules, line {} - {}", linenr + 1, err);
        }
    }

    parser.finish()
}

/// Interns strings so that equal text is always the same allocation.
#[derive(Default)]
struct Interner {
    strings: HashSet<Arc<str>>,
}

impl Interner {
    fn intern(&mut self, text: &str) -> Arc<str> {
        if let Some(interned) = self.strings.get(text) {
            return interned.clone();
        }
        let interned: Arc<str> = Arc::from(text);
        self.strings.insert(interned.clone());
        interned
    }
}

enum Member {
    User(Arc<str>),
    Group(Arc<str>),
}

#[derive(Default)]
enum Section {
    #[default]
    None,
    Groups,
    /// Index of the open rule section in `Parser::acls`.
    Rule(usize),
}

#[derive(Default)]
struct Parser {
    interner: Interner,
    acls: Vec<Acl>,
    raw_groups: HashMap<Arc<str>, Vec<Member>>,
    section: Section,
}

impl Parser {
    fn parse_line(&mut self, line: &str) -> Result<(), Error> {
        if let Some(header) = line.strip_prefix('[') {
            let Some(header) = header.strip_suffix(']') else {
                bail!("unterminated section header");
            };
            return self.open_section(header.trim());
        }

        let Some((name, value)) = line.split_once('=') else {
            bail!("expected 'name = value'");
        };
        let (name, value) = (name.trim(), value.trim());

        match self.section {
            Section::None => bail!("entry outside of any section"),
            Section::Groups => self.add_group(name, value),
            Section::Rule(index) => self.add_entry(index, name, value),
        }
    }

    fn open_section(&mut self, header: &str) -> Result<(), Error> {
        if header == "groups" {
            self.section = Section::Groups;
            return Ok(());
        }

        let (repos, path) = match header.split_once(':') {
            Some((repos, path)) => (repos.trim(), path.trim()),
            None => (ANY_REPOSITORY, header),
        };
        if !path.starts_with('/') {
            bail!("rule path '{path}' must start with '/'");
        }

        let path = self.parse_rule_path(path)?;
        let sequence_number = self.acls.len() as i32 + 1;
        self.acls.push(Acl {
            sequence_number,
            repos: self.interner.intern(repos),
            path,
            entries: Vec::new(),
        });
        self.section = Section::Rule(self.acls.len() - 1);

        Ok(())
    }

    fn parse_rule_path(&mut self, path: &str) -> Result<Vec<Segment>, Error> {
        let mut segments = Vec::new();

        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            let segment = self.parse_segment(part)?;
            // '**' already matches any number of segments, repetitions of it
            // add nothing and would break the zero-segment folds in the
            // lookup.
            if matches!(segment, Segment::AnyRecursive)
                && matches!(segments.last(), Some(Segment::AnyRecursive))
            {
                continue;
            }
            segments.push(segment);
        }

        Ok(segments)
    }

    fn parse_segment(&mut self, part: &str) -> Result<Segment, Error> {
        match part {
            "*" => return Ok(Segment::AnySegment),
            "**" => return Ok(Segment::AnyRecursive),
            _ => (),
        }

        if !part.contains(['*', '?', '[']) {
            return Ok(Segment::Literal(self.interner.intern(part)));
        }

        if part.matches(['*', '?', '[']).count() == 1 {
            if let Some(prefix) = part.strip_suffix('*') {
                return Ok(Segment::Prefix(self.interner.intern(prefix)));
            }
            if let Some(suffix) = part.strip_prefix('*') {
                let reversed: String = suffix.chars().rev().collect();
                return Ok(Segment::Suffix(self.interner.intern(&reversed)));
            }
        }

        Ok(Segment::Fnmatch(GlobSegment::new(
            self.interner.intern(part),
        )?))
    }

    fn add_group(&mut self, name: &str, value: &str) -> Result<(), Error> {
        if name.is_empty() || name.starts_with('@') {
            bail!("invalid group name '{name}'");
        }

        let mut members = Vec::new();
        for member in value.split(',') {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            if let Some(group) = member.strip_prefix('@') {
                members.push(Member::Group(self.interner.intern(group)));
            } else {
                members.push(Member::User(self.interner.intern(member)));
            }
        }

        let name = self.interner.intern(name);
        if self.raw_groups.insert(name.clone(), members).is_some() {
            bail!("group '{name}' defined twice");
        }

        Ok(())
    }

    fn add_entry(&mut self, index: usize, principal: &str, rights: &str) -> Result<(), Error> {
        let principal = match principal {
            "" => bail!("empty principal"),
            "*" => Principal::Everyone,
            "$anonymous" => Principal::Anonymous,
            "$authenticated" => Principal::Authenticated,
            _ if principal.starts_with('$') => bail!("unknown token '{principal}'"),
            _ => match principal.strip_prefix('@') {
                Some(group) => Principal::Group(self.interner.intern(group)),
                None => Principal::User(self.interner.intern(principal)),
            },
        };

        let rights = parse_rights(rights)?;
        self.acls[index].entries.push(AclEntry { principal, rights });

        Ok(())
    }

    fn finish(self) -> Result<AuthzModel, Error> {
        let mut groups = HashMap::new();

        for name in self.raw_groups.keys() {
            let mut members = HashSet::new();
            let mut trail = Vec::new();
            collect_members(&self.raw_groups, name, &mut members, &mut trail)?;
            groups.insert(name.clone(), members);
        }

        Ok(AuthzModel {
            acls: self.acls,
            groups,
        })
    }
}

fn parse_rights(value: &str) -> Result<Access, Error> {
    let mut rights = Access::empty();
    for ch in value.chars() {
        match ch {
            'r' => rights |= Access::READ,
            'w' => rights |= Access::WRITE,
            _ => bail!("invalid rights '{value}', expected a combination of 'r' and 'w'"),
        }
    }
    Ok(rights)
}

/// Flatten `name` and every group it references into `members`. The `trail`
/// of groups currently being expanded catches circular definitions.
fn collect_members(
    raw: &HashMap<Arc<str>, Vec<Member>>,
    name: &Arc<str>,
    members: &mut HashSet<Arc<str>>,
    trail: &mut Vec<Arc<str>>,
) -> Result<(), Error> {
    if trail.iter().any(|seen| Arc::ptr_eq(seen, name)) {
        bail!("circular dependency in group '{name}'");
    }
    let Some(list) = raw.get(name) else {
        bail!("reference to undefined group '{name}'");
    };

    trail.push(name.clone());
    for member in list {
        match member {
            Member::User(user) => {
                members.insert(user.clone());
            }
            Member::Group(group) => collect_members(raw, group, members, trail)?,
        }
    }
    trail.pop();

    Ok(())
}
