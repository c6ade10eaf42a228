//! Filter and query construction.
//!
//! Builders collect structured terms and textual expressions, hand them to
//! the engine for compilation, then walk the compiled term list to bind each
//! term to its [`TypedComponent`]. The binding is what lets an
//! [`IterationCursor`] turn raw columns back into typed views.
//!
//! A pair term binds to its relation when the relation is a typed component,
//! otherwise to its target when the target is one, otherwise it stays unbound.
//! Unbound terms (tags, data-less pairs) keep their slot in the term order.

use std::sync::Arc;

use crate::component::{ComponentRegistry, TypedComponent};
use crate::cursor::IterationCursor;
use crate::engine::memory::MemoryEngine;
use crate::engine::{EngineIter, StorageEngine};
use crate::entity::Id;
use crate::term::{FilterDesc, Term};
use crate::world::World;
use crate::TesseraError;

/// A term bound to a typed component.
#[derive(Debug, Clone)]
pub struct ComponentEntry {
    pub component: Arc<TypedComponent>,
    /// 1-based position of the term in the compiled term list.
    pub index: usize,
}

/// Typed component backing `id`, following the pair binding order.
pub(crate) fn component_for(registry: &ComponentRegistry, id: Id) -> Option<Arc<TypedComponent>> {
    match id {
        Id::Entity(e) => registry.lookup_by_id(e),
        Id::Pair(p) => registry
            .lookup_by_id(p.relation)
            .or_else(|| registry.lookup_by_id(p.target)),
    }
}

fn bind_components(registry: &ComponentRegistry, terms: &[Term]) -> Vec<ComponentEntry> {
    terms
        .iter()
        .enumerate()
        .filter_map(|(i, term)| {
            component_for(registry, term.id).map(|component| ComponentEntry {
                component,
                index: i + 1,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// A compiled, re-iterable matcher.
///
/// Bound to the world it was built from; iterating it against another world
/// is a logic error.
pub struct Filter<E: StorageEngine = MemoryEngine> {
    matcher: E::Matcher,
    terms: Vec<Term>,
    components: Vec<ComponentEntry>,
    name: Option<String>,
}

impl<E: StorageEngine> Filter<E> {
    fn compile(world: &mut World<E>, desc: FilterDesc) -> Result<Self, TesseraError> {
        let max = world.config().max_terms;
        if desc.terms.len() > max {
            return Err(TesseraError::TooManyTerms {
                count: desc.terms.len(),
                max,
            });
        }
        let matcher = world.engine_mut().compile(&desc)?;
        let terms = world.engine().terms(&matcher).to_vec();
        if terms.len() > max {
            return Err(TesseraError::TooManyTerms {
                count: terms.len(),
                max,
            });
        }
        let components = bind_components(world.registry(), &terms);
        tracing::debug!(
            name = desc.name.as_deref().unwrap_or(""),
            terms = terms.len(),
            components = components.len(),
            "built filter"
        );
        Ok(Self {
            matcher,
            terms,
            components,
            name: desc.name,
        })
    }

    /// Start a fresh pass over the current match.
    pub fn iter<'a>(&'a mut self, world: &'a mut World<E>) -> IterationCursor<'a, E> {
        let iter = world.engine_mut().iter(&mut self.matcher);
        IterationCursor::new(iter, &self.terms, &self.components)
    }

    /// Total rows across every group of one pass.
    pub fn count(&mut self, world: &mut World<E>) -> usize {
        let mut iter = world.engine_mut().iter(&mut self.matcher);
        let mut rows = 0;
        while iter.next() {
            rows += iter.count();
        }
        rows
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The compiled terms, structured terms first.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Terms bound to typed components, in term order.
    pub fn components(&self) -> &[ComponentEntry] {
        &self.components
    }
}

impl<E: StorageEngine> std::fmt::Debug for Filter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("terms", &self.terms)
            .field("components", &self.components.len())
            .finish()
    }
}

/// A filter whose archetype match is cached by the engine and reused until
/// the world's structure changes.
pub struct Query<E: StorageEngine = MemoryEngine> {
    filter: Filter<E>,
}

impl<E: StorageEngine> Query<E> {
    pub fn iter<'a>(&'a mut self, world: &'a mut World<E>) -> IterationCursor<'a, E> {
        self.filter.iter(world)
    }

    pub fn count(&mut self, world: &mut World<E>) -> usize {
        self.filter.count(world)
    }

    pub fn name(&self) -> Option<&str> {
        self.filter.name()
    }

    pub fn terms(&self) -> &[Term] {
        self.filter.terms()
    }

    pub fn term_count(&self) -> usize {
        self.filter.term_count()
    }

    pub fn components(&self) -> &[ComponentEntry] {
        self.filter.components()
    }
}

impl<E: StorageEngine> std::fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Query").field(&self.filter).finish()
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Accumulates terms for a [`Filter`].
pub struct FilterBuilder<'w, E: StorageEngine = MemoryEngine> {
    world: &'w mut World<E>,
    desc: FilterDesc,
    exprs: Vec<String>,
}

impl<'w, E: StorageEngine> FilterBuilder<'w, E> {
    pub(crate) fn new(world: &'w mut World<E>) -> Self {
        let instanced = world.config().default_instanced;
        Self {
            world,
            desc: FilterDesc {
                instanced,
                ..FilterDesc::default()
            },
            exprs: Vec::new(),
        }
    }

    /// Append a required term for a component, tag, entity or pair.
    pub fn term(mut self, id: impl Into<Id>) -> Self {
        self.desc.terms.push(Term::new(id));
        self
    }

    /// Append a fully specified term.
    pub fn with(mut self, term: Term) -> Self {
        self.desc.terms.push(term);
        self
    }

    /// Append textual terms. Expression terms follow all structured terms.
    pub fn expr(mut self, expr: &str) -> Self {
        self.exprs.push(expr.to_owned());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.desc.name = Some(name.to_owned());
        self
    }

    /// Keep groups with shared columns whole instead of one row per step.
    pub fn instanced(mut self, instanced: bool) -> Self {
        self.desc.instanced = instanced;
        self
    }

    fn finish(mut self, cached: bool) -> (&'w mut World<E>, FilterDesc) {
        let exprs: Vec<&str> = self.exprs.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        if !exprs.is_empty() {
            self.desc.expr = Some(exprs.join(", "));
        }
        self.desc.cached = cached;
        (self.world, self.desc)
    }

    pub fn build(self) -> Result<Filter<E>, TesseraError> {
        let (world, desc) = self.finish(false);
        Filter::compile(world, desc)
    }
}

/// Accumulates terms for a [`Query`].
pub struct QueryBuilder<'w, E: StorageEngine = MemoryEngine> {
    inner: FilterBuilder<'w, E>,
}

impl<'w, E: StorageEngine> QueryBuilder<'w, E> {
    pub(crate) fn new(world: &'w mut World<E>) -> Self {
        Self {
            inner: FilterBuilder::new(world),
        }
    }

    pub fn term(self, id: impl Into<Id>) -> Self {
        Self {
            inner: self.inner.term(id),
        }
    }

    pub fn with(self, term: Term) -> Self {
        Self {
            inner: self.inner.with(term),
        }
    }

    pub fn expr(self, expr: &str) -> Self {
        Self {
            inner: self.inner.expr(expr),
        }
    }

    pub fn name(self, name: &str) -> Self {
        Self {
            inner: self.inner.name(name),
        }
    }

    pub fn instanced(self, instanced: bool) -> Self {
        Self {
            inner: self.inner.instanced(instanced),
        }
    }

    pub fn build(self) -> Result<Query<E>, TesseraError> {
        let (world, desc) = self.inner.finish(true);
        Ok(Query {
            filter: Filter::compile(world, desc)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Pair;
    use crate::term::Access;

    #[test]
    fn components_bind_with_one_based_indices() {
        let mut world = World::new();
        let pos = world.component::<f32>("Position", &[2]).unwrap();
        let tag = world.tag("Marker").unwrap();
        let vel = world.component::<f32>("Velocity", &[2]).unwrap();

        let filter = world
            .filter_builder()
            .term(&pos)
            .term(tag)
            .expr("Velocity")
            .build()
            .unwrap();
        assert_eq!(filter.term_count(), 3);
        let bound: Vec<(String, usize)> = filter
            .components()
            .iter()
            .map(|c| (c.component.name().to_owned(), c.index))
            .collect();
        assert_eq!(bound, vec![("Position".to_owned(), 1), ("Velocity".to_owned(), 3)]);
        assert!(Arc::ptr_eq(&filter.components()[1].component, &vel));
    }

    #[test]
    fn pairs_bind_relation_then_target() {
        let mut world = World::new();
        let pos = world.component::<f32>("Position", &[2]).unwrap();
        let local = world.entity_named("Local").unwrap();
        let likes = world.tag("Likes").unwrap();
        let other = world.entity().unwrap();

        let filter = world
            .filter_builder()
            .term(Pair::new(pos.id(), local))
            .term(Pair::new(likes, pos.id()))
            .term(Pair::new(likes, other))
            .build()
            .unwrap();
        let indices: Vec<usize> = filter.components().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(filter.term_count(), 3);
    }

    #[test]
    fn default_access_is_resolved_at_compile() {
        let mut world = World::new();
        world.component::<f32>("Position", &[2]).unwrap();
        let filter = world
            .filter_builder()
            .expr("Position, [in]?Position(parent)")
            .build()
            .unwrap();
        assert_eq!(filter.terms()[0].access, Access::InOut);
        assert_eq!(filter.terms()[1].access, Access::In);
    }

    #[test]
    fn too_many_terms_is_rejected() {
        let mut world = World::with_config(crate::world::WorldConfig {
            max_terms: 1,
            ..Default::default()
        });
        world.component::<f32>("A", &[1]).unwrap();
        world.component::<f32>("B", &[1]).unwrap();
        let err = world.filter_builder().expr("A, B").build().unwrap_err();
        assert!(matches!(err, TesseraError::TooManyTerms { count: 2, max: 1 }));
    }

    #[test]
    fn parse_errors_propagate_from_engine() {
        let mut world = World::new();
        let err = world.query_builder().expr("Missing").build().unwrap_err();
        assert!(matches!(
            err,
            TesseraError::Engine(crate::engine::EngineError::UnknownName { .. })
        ));
    }
}
