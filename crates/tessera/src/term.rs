//! Filter terms.
//!
//! A [`Term`] is one clause of a filter or query: an [`Id`] to match, how to
//! combine it ([`TermOper`]), how the iteration will access its column
//! ([`Access`]) and where the value is looked up ([`TermSource`]).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TermOper {
    /// The id must be present.
    #[default]
    And,
    /// Match with or without the id.
    Optional,
    /// The id must be absent.
    Not,
}

/// Declared column access.
///
/// `Default` is resolved when the term is compiled: terms matched on the
/// iterated entity become `InOut`, terms matched elsewhere become `In`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Access {
    #[default]
    Default,
    In,
    Out,
    InOut,
    None,
}

impl Access {
    /// Whether a column with this access may be written through.
    pub fn is_writable(self) -> bool {
        matches!(self, Access::Default | Access::Out | Access::InOut)
    }
}

/// Where a term's id is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TermSource {
    /// The iterated entity, falling through to its `IsA` bases.
    #[default]
    This,
    /// A fixed entity.
    Entity(Entity),
    /// Ancestors along `ChildOf`. With `include_self` the iterated entity is
    /// checked first; with `cascade` matched groups are ordered by depth.
    Up { cascade: bool, include_self: bool },
}

impl TermSource {
    pub fn is_this(&self) -> bool {
        matches!(self, TermSource::This)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub id: Id,
    pub oper: TermOper,
    pub access: Access,
    pub source: TermSource,
}

impl Term {
    pub fn new(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            oper: TermOper::And,
            access: Access::Default,
            source: TermSource::This,
        }
    }

    pub fn optional(mut self) -> Self {
        self.oper = TermOper::Optional;
        self
    }

    pub fn not(mut self) -> Self {
        self.oper = TermOper::Not;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn source(mut self, source: TermSource) -> Self {
        self.source = source;
        self
    }

    /// Match on the nearest ancestor that has the id.
    pub fn parent(self) -> Self {
        self.source(TermSource::Up {
            cascade: false,
            include_self: false,
        })
    }

    /// Like [`parent`](Self::parent), with groups ordered breadth-first.
    pub fn cascade(self) -> Self {
        self.source(TermSource::Up {
            cascade: true,
            include_self: false,
        })
    }

    pub fn from_entity(self, entity: Entity) -> Self {
        self.source(TermSource::Entity(entity))
    }

    /// Replace `Access::Default` with the concrete access for this source.
    pub fn resolve_access(mut self) -> Self {
        if self.access == Access::Default {
            self.access = if self.source.is_this() {
                Access::InOut
            } else {
                Access::In
            };
        }
        self
    }
}

impl From<Id> for Term {
    fn from(id: Id) -> Self {
        Term::new(id)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.access {
            Access::Default => {}
            Access::In => f.write_str("[in] ")?,
            Access::Out => f.write_str("[out] ")?,
            Access::InOut => f.write_str("[inout] ")?,
            Access::None => f.write_str("[none] ")?,
        }
        match self.oper {
            TermOper::And => {}
            TermOper::Optional => f.write_str("?")?,
            TermOper::Not => f.write_str("!")?,
        }
        write!(f, "{}", self.id)?;
        match self.source {
            TermSource::This => Ok(()),
            TermSource::Entity(e) => write!(f, " from {e}"),
            TermSource::Up { cascade: true, .. } => f.write_str(" (cascade)"),
            TermSource::Up { .. } => f.write_str(" (up)"),
        }
    }
}

/// Everything the engine needs to compile a matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDesc {
    pub name: Option<String>,
    /// Structured terms, matched before `expr` terms.
    pub terms: Vec<Term>,
    /// Optional textual term list.
    pub expr: Option<String>,
    /// Keep groups with shared columns whole instead of splitting per row.
    pub instanced: bool,
    /// Ask for a matcher that caches its archetype groups.
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_access_resolves_by_source() {
        let c = Entity::new(3, 0);
        assert_eq!(Term::new(c).resolve_access().access, Access::InOut);
        assert_eq!(Term::new(c).parent().resolve_access().access, Access::In);
        assert_eq!(
            Term::new(c).cascade().access(Access::Out).resolve_access().access,
            Access::Out
        );
    }

    #[test]
    fn builder_sets_oper_and_source() {
        let t = Term::new(Entity::new(1, 0)).optional().cascade();
        assert_eq!(t.oper, TermOper::Optional);
        assert_eq!(
            t.source,
            TermSource::Up {
                cascade: true,
                include_self: false
            }
        );
        assert!(!Access::In.is_writable());
        assert!(Access::Out.is_writable());
    }
}
