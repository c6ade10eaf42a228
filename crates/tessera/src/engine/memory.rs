//! In-process archetype store.
//!
//! [`MemoryEngine`] owns the entity allocator, every [`Archetype`] table, the
//! name index and the built-in `ChildOf`, `IsA` and `Prefab` entities. Adding
//! or removing an id migrates the entity between archetypes; every such
//! structural change bumps a version counter that cached matchers compare
//! against.
//!
//! Matching is a linear scan over archetypes. Term sources are resolved per
//! archetype: `ChildOf` and `IsA` pairs are part of the archetype signature,
//! so all rows of a table share the same parent and the same bases.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;

use super::archetype::{Archetype, ArchetypeId, MAX_ALIGN};
use super::expr;
use super::{ComponentLayout, EngineError, EngineIter, RawColumn, StorageEngine};
use crate::entity::{Entity, EntityAllocator, Id, Pair};
use crate::term::{FilterDesc, Term, TermOper, TermSource};

/// Default bound on `ChildOf`/`IsA` walks.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Entity location
// ---------------------------------------------------------------------------

/// Where an entity lives: which archetype and which row within it.
#[derive(Debug, Clone, Copy)]
struct EntityLocation {
    archetype_id: ArchetypeId,
    row: usize,
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

pub struct MemoryEngine {
    allocator: EntityAllocator,
    locations: HashMap<Entity, EntityLocation>,
    archetypes: Vec<Archetype>,
    archetype_index: HashMap<Vec<Id>, ArchetypeId>,
    layouts: HashMap<Entity, ComponentLayout>,
    names: HashMap<Entity, String>,
    /// Name -> every live entity carrying it, at any depth.
    named: HashMap<String, Vec<Entity>>,
    child_of: Entity,
    is_a: Entity,
    prefab: Entity,
    structure_version: u64,
    max_depth: usize,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("entity_count", &self.locations.len())
            .field("archetype_count", &self.archetypes.len())
            .field("structure_version", &self.structure_version)
            .finish()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Create an engine whose relationship walks stop after `max_depth` hops.
    pub fn with_max_depth(max_depth: usize) -> Self {
        let root = Archetype::empty(ArchetypeId(0));
        let mut archetype_index = HashMap::new();
        archetype_index.insert(Vec::new(), ArchetypeId(0));

        let placeholder = Entity::from_raw(u64::MAX);
        let mut engine = Self {
            allocator: EntityAllocator::new(),
            locations: HashMap::new(),
            archetypes: vec![root],
            archetype_index,
            layouts: HashMap::new(),
            names: HashMap::new(),
            named: HashMap::new(),
            child_of: placeholder,
            is_a: placeholder,
            prefab: placeholder,
            structure_version: 0,
            max_depth,
        };
        engine.child_of = engine.spawn_builtin("ChildOf");
        engine.is_a = engine.spawn_builtin("IsA");
        engine.prefab = engine.spawn_builtin("Prefab");
        engine
    }

    fn spawn_builtin(&mut self, name: &str) -> Entity {
        let e = self.spawn();
        self.set_name(e, name);
        self.layouts.insert(e, ComponentLayout::TAG);
        e
    }

    /// Number of archetype tables, including empty ones.
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Incremented on every structural change.
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    // -- bookkeeping --------------------------------------------------------

    fn spawn(&mut self) -> Entity {
        let e = self.allocator.allocate();
        let row = self.archetypes[0].push(e, |_| None);
        self.locations.insert(
            e,
            EntityLocation {
                archetype_id: ArchetypeId(0),
                row,
            },
        );
        self.structure_version += 1;
        e
    }

    fn location(&self, entity: Entity) -> Result<EntityLocation, EngineError> {
        if !self.allocator.is_alive(entity) {
            return Err(EngineError::StaleEntity { entity });
        }
        self.locations
            .get(&entity)
            .copied()
            .ok_or(EngineError::StaleEntity { entity })
    }

    fn archetype_of(&self, entity: Entity) -> Option<&Archetype> {
        let loc = self.location(entity).ok()?;
        Some(&self.archetypes[loc.archetype_id.index()])
    }

    fn check_id(&self, id: Id) -> Result<(), EngineError> {
        let check = |entity: Entity| {
            if self.allocator.is_alive(entity) {
                Ok(())
            } else {
                Err(EngineError::StaleEntity { entity })
            }
        };
        match id {
            Id::Entity(e) => check(e),
            Id::Pair(p) => {
                check(p.relation)?;
                check(p.target)
            }
        }
    }

    fn validate_name(name: &str) -> Result<(), EngineError> {
        if name.is_empty() || name.contains('.') {
            return Err(EngineError::InvalidName {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    fn set_name(&mut self, entity: Entity, name: &str) {
        self.names.insert(entity, name.to_owned());
        self.named.entry(name.to_owned()).or_default().push(entity);
    }

    fn clear_name(&mut self, entity: Entity) {
        if let Some(name) = self.names.remove(&entity) {
            if let Some(list) = self.named.get_mut(&name) {
                list.retain(|&e| e != entity);
                if list.is_empty() {
                    self.named.remove(&name);
                }
            }
        }
    }

    fn find_or_create_archetype(&mut self, ids: Vec<Id>) -> Result<ArchetypeId, EngineError> {
        if let Some(&id) = self.archetype_index.get(&ids) {
            return Ok(id);
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(id, ids.clone(), |i| self.data_layout(i))?;
        tracing::trace!(archetype = id.0, ids = ids.len(), "created archetype");
        self.archetypes.push(archetype);
        self.archetype_index.insert(ids, id);
        Ok(id)
    }

    /// Move `entity` into the archetype for `ids` (sorted, deduplicated),
    /// carrying over shared columns and writing `data` if given.
    fn migrate(&mut self, entity: Entity, ids: Vec<Id>, data: Option<(Id, &[u8])>) -> Result<(), EngineError> {
        let loc = self.location(entity)?;
        let target = self.find_or_create_archetype(ids)?;
        if target == loc.archetype_id {
            return Ok(());
        }

        let carried = self.archetypes[loc.archetype_id.index()].row_data(loc.row);
        let row = self.archetypes[target.index()].push(entity, |id| match data {
            Some((d, bytes)) if d == id => Some(bytes),
            _ => carried.iter().find(|(i, _)| *i == id).map(|(_, b)| b.as_slice()),
        });
        if let Some(moved) = self.archetypes[loc.archetype_id.index()].swap_remove(loc.row) {
            if let Some(moved_loc) = self.locations.get_mut(&moved) {
                moved_loc.row = loc.row;
            }
        }
        self.locations.insert(
            entity,
            EntityLocation {
                archetype_id: target,
                row,
            },
        );
        self.structure_version += 1;
        Ok(())
    }

    fn relation_targets(ids: &[Id], relation: Entity) -> impl Iterator<Item = Entity> + '_ {
        ids.iter().filter_map(move |id| match id {
            Id::Pair(p) if p.relation == relation => Some(p.target),
            _ => None,
        })
    }

    fn parent_in(&self, ids: &[Id]) -> Option<Entity> {
        Self::relation_targets(ids, self.child_of).next()
    }

    /// The `ChildOf` target of `entity`.
    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.archetype_of(entity).and_then(|a| self.parent_in(a.ids()))
    }

    /// Direct `ChildOf` children of `entity`.
    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        let edge = Id::Pair(Pair::new(self.child_of, entity));
        self.archetypes
            .iter()
            .filter(|a| a.has(edge))
            .flat_map(|a| a.entities().iter().copied())
            .collect()
    }

    /// Ids that are never inherited through `IsA`.
    fn inheritable(&self, id: Id) -> bool {
        match id {
            Id::Entity(e) => e != self.prefab,
            Id::Pair(p) => p.relation != self.child_of && p.relation != self.is_a,
        }
    }

    /// The entity that stores `id` for `entity`: itself, or the nearest base
    /// along `IsA` edges. `depth` is the hop count already spent reaching
    /// `entity`. Each base is visited once, so shared ancestors in a diamond
    /// are not re-walked.
    fn owner_of(&self, entity: Entity, id: Id, depth: usize) -> Option<Entity> {
        let inheritable = self.inheritable(id);
        let mut queue = VecDeque::from([(entity, depth)]);
        let mut seen = HashSet::new();
        while let Some((e, hops)) = queue.pop_front() {
            if !seen.insert(e) {
                continue;
            }
            let Some(archetype) = self.archetype_of(e) else {
                continue;
            };
            if archetype.has(id) {
                return Some(e);
            }
            if !inheritable || hops >= self.max_depth {
                continue;
            }
            queue.extend(Self::relation_targets(archetype.ids(), self.is_a).map(|base| (base, hops + 1)));
        }
        None
    }

    /// Nearest owner of `id` starting at `start` and walking up `ChildOf`.
    fn owner_up(&self, start: Entity, id: Id) -> Option<Entity> {
        let mut current = start;
        for _ in 0..self.max_depth {
            if let Some(owner) = self.owner_of(current, id, 0) {
                return Some(owner);
            }
            current = self.parent(current)?;
        }
        None
    }

    fn depth(&self, ids: &[Id]) -> usize {
        let mut depth = 0;
        let mut parent = self.parent_in(ids);
        while let Some(p) = parent {
            depth += 1;
            if depth > self.max_depth {
                break;
            }
            parent = self.parent(p);
        }
        depth
    }

    /// Whether following `relation` from `from` reaches `to`.
    fn reaches(&self, from: Entity, relation: Entity, to: Entity) -> bool {
        let mut queue = VecDeque::from([(from, 0usize)]);
        let mut seen = HashSet::new();
        while let Some((e, depth)) = queue.pop_front() {
            if e == to {
                return true;
            }
            if depth >= self.max_depth || !seen.insert(e) {
                continue;
            }
            if let Some(a) = self.archetype_of(e) {
                queue.extend(Self::relation_targets(a.ids(), relation).map(|t| (t, depth + 1)));
            }
        }
        false
    }

    fn check_relationship(&self, entity: Entity, id: Id) -> Result<(), EngineError> {
        if let Id::Pair(p) = id {
            if (p.relation == self.child_of || p.relation == self.is_a) && self.reaches(p.target, p.relation, entity) {
                return Err(EngineError::Cycle {
                    entity,
                    relation: p.relation,
                });
            }
        }
        Ok(())
    }

    /// Root-level entity with exactly this name.
    fn root_named(&self, name: &str) -> Option<Entity> {
        self.child_named(None, name)
    }

    fn child_named(&self, parent: Option<Entity>, name: &str) -> Option<Entity> {
        self.named
            .get(name)?
            .iter()
            .copied()
            .find(|&e| self.parent(e) == parent)
    }

    fn insert(&mut self, entity: Entity, id: Id, data: Option<&[u8]>) -> Result<(), EngineError> {
        self.check_id(id)?;
        let loc = self.location(entity)?;
        let current = self.archetypes[loc.archetype_id.index()].ids();
        if current.binary_search(&id).is_ok() {
            return Ok(());
        }
        self.check_relationship(entity, id)?;

        let mut ids: Vec<Id> = current.to_vec();
        if let Id::Pair(p) = id {
            if p.relation == self.child_of {
                // One parent at a time.
                ids.retain(|i| !matches!(i, Id::Pair(q) if q.relation == self.child_of));
            }
        }
        ids.push(id);
        ids.sort();
        self.migrate(entity, ids, data.map(|d| (id, d)))
    }

    /// Remove every id mentioning a destroyed entity from the survivors.
    fn prune_dangling(&mut self, dead: &HashSet<Entity>) -> Result<(), EngineError> {
        let affected: Vec<Entity> = self
            .archetypes
            .iter()
            .filter(|a| !a.is_empty() && a.ids().iter().any(|id| dead.iter().any(|&d| id.mentions(d))))
            .flat_map(|a| a.entities().iter().copied())
            .collect();
        if affected.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            entities = affected.len(),
            "removing relationships to destroyed entities"
        );
        for e in affected {
            let loc = self.location(e)?;
            let ids: Vec<Id> = self.archetypes[loc.archetype_id.index()]
                .ids()
                .iter()
                .copied()
                .filter(|id| !dead.iter().any(|&d| id.mentions(d)))
                .collect();
            self.migrate(e, ids, None)?;
        }
        Ok(())
    }

    // -- matching -----------------------------------------------------------

    fn resolve_term(&self, archetype: &Archetype, term: &Term) -> Option<Source> {
        let id = term.id;
        let found = match term.source {
            TermSource::This => {
                if archetype.has(id) {
                    Some(Source::Owned)
                } else if self.inheritable(id) {
                    Self::relation_targets(archetype.ids(), self.is_a)
                        .find_map(|base| self.owner_of(base, id, 1))
                        .map(Source::Shared)
                } else {
                    None
                }
            }
            TermSource::Up { include_self, .. } => {
                if include_self && archetype.has(id) {
                    Some(Source::Owned)
                } else {
                    self.parent_in(archetype.ids())
                        .and_then(|p| self.owner_up(p, id))
                        .map(Source::Shared)
                }
            }
            TermSource::Entity(src) => self.owner_of(src, id, 0).map(Source::Shared),
        };
        match term.oper {
            TermOper::And => found,
            TermOper::Optional => Some(found.unwrap_or(Source::Unset)),
            TermOper::Not => match found {
                Some(_) => None,
                None => Some(Source::Unset),
            },
        }
    }

    fn match_groups(&self, terms: &[Term]) -> Vec<Group> {
        let wants_prefab = terms.iter().any(|t| t.id.mentions(self.prefab));
        let cascade = terms
            .iter()
            .any(|t| matches!(t.source, TermSource::Up { cascade: true, .. }));
        let per_archetype = terms
            .iter()
            .any(|t| !matches!(t.source, TermSource::Entity(_)));

        if !per_archetype {
            // Only fixed sources: a single step with no rows.
            let empty = Archetype::empty(ArchetypeId(u32::MAX));
            let sources: Option<Vec<Source>> = terms.iter().map(|t| self.resolve_term(&empty, t)).collect();
            return sources
                .map(|sources| {
                    vec![Group {
                        archetype: None,
                        shared: false,
                        depth: 0,
                        sources,
                    }]
                })
                .unwrap_or_default();
        }

        let mut groups = Vec::new();
        for archetype in &self.archetypes {
            if !wants_prefab && archetype.has(Id::Entity(self.prefab)) {
                continue;
            }
            let sources: Option<Vec<Source>> = terms.iter().map(|t| self.resolve_term(archetype, t)).collect();
            let Some(sources) = sources else {
                continue;
            };
            groups.push(Group {
                archetype: Some(archetype.id()),
                shared: sources.iter().any(|s| matches!(s, Source::Shared(_))),
                depth: if cascade { self.depth(archetype.ids()) } else { 0 },
                sources,
            });
        }
        if cascade {
            groups.sort_by_key(|g| g.depth);
        }
        groups
    }

    fn column_of(&mut self, owner: Entity, id: Id) -> Option<(NonNull<u8>, usize)> {
        let loc = *self.locations.get(&owner)?;
        let archetype = &mut self.archetypes[loc.archetype_id.index()];
        let index = archetype.column_index(id)?;
        let column = archetype.column_at_mut(index);
        let size = column.item_size();
        let ptr = column.as_mut_ptr().wrapping_add(loc.row * size);
        Some((NonNull::new(ptr)?, size))
    }
}

// ---------------------------------------------------------------------------
// StorageEngine impl
// ---------------------------------------------------------------------------

impl StorageEngine for MemoryEngine {
    type Matcher = MemoryMatcher;
    type Iter<'e> = MemoryIter<'e>;

    fn new_entity(&mut self, name: Option<&str>) -> Result<Entity, EngineError> {
        let Some(name) = name else {
            return Ok(self.spawn());
        };
        Self::validate_name(name)?;
        if let Some(existing) = self.root_named(name) {
            return Ok(existing);
        }
        let e = self.spawn();
        self.set_name(e, name);
        Ok(e)
    }

    fn new_component(&mut self, name: &str, layout: ComponentLayout) -> Result<Entity, EngineError> {
        Self::validate_name(name)?;
        if layout.align > MAX_ALIGN || !layout.align.is_power_of_two() {
            return Err(EngineError::UnsupportedAlignment {
                align: layout.align,
                max: MAX_ALIGN,
            });
        }
        if let Some(existing) = self.root_named(name) {
            return match self.layouts.get(&existing) {
                Some(l) if *l == layout => Ok(existing),
                Some(_) => Err(EngineError::LayoutConflict { name: name.to_owned() }),
                None => {
                    // A plain entity becomes a component only if no table uses it yet.
                    let in_use = self
                        .archetypes
                        .iter()
                        .any(|a| a.ids().iter().any(|id| id.mentions(existing)));
                    if in_use && !layout.is_tag() {
                        return Err(EngineError::LayoutConflict { name: name.to_owned() });
                    }
                    self.layouts.insert(existing, layout);
                    Ok(existing)
                }
            };
        }
        let e = self.spawn();
        self.set_name(e, name);
        self.layouts.insert(e, layout);
        Ok(e)
    }

    fn destroy(&mut self, entity: Entity) -> Result<(), EngineError> {
        self.location(entity)?;

        // Breadth-first over the ChildOf subtree.
        let mut doomed = vec![entity];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let children = self.children(doomed[cursor]);
            doomed.extend(children);
            cursor += 1;
        }
        tracing::debug!(entity = %entity, descendants = doomed.len() - 1, "destroying entity");

        for &e in &doomed {
            let loc = self.location(e)?;
            if let Some(moved) = self.archetypes[loc.archetype_id.index()].swap_remove(loc.row) {
                if let Some(moved_loc) = self.locations.get_mut(&moved) {
                    moved_loc.row = loc.row;
                }
            }
            self.locations.remove(&e);
            self.clear_name(e);
            self.layouts.remove(&e);
            self.allocator.deallocate(e);
        }
        self.structure_version += 1;

        let dead: HashSet<Entity> = doomed.into_iter().collect();
        self.prune_dangling(&dead)
    }

    fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.is_alive(entity)
    }

    fn alive_count(&self) -> usize {
        self.allocator.alive_count()
    }

    fn name(&self, entity: Entity) -> Option<&str> {
        self.names.get(&entity).map(String::as_str)
    }

    fn path(&self, entity: Entity) -> Result<String, EngineError> {
        self.location(entity)?;
        let mut segments = Vec::new();
        let mut current = Some(entity);
        while let Some(e) = current {
            if segments.len() > self.max_depth {
                return Err(EngineError::DepthExceeded {
                    entity,
                    limit: self.max_depth,
                });
            }
            segments.push(match self.names.get(&e) {
                Some(name) => name.clone(),
                None => format!("#{}", e.index()),
            });
            current = self.parent(e);
        }
        segments.reverse();
        Ok(segments.join("."))
    }

    fn lookup(&self, scope: Option<Entity>, path: &str) -> Option<Entity> {
        if path.is_empty() {
            return None;
        }
        let mut current = scope;
        for segment in path.split('.') {
            current = Some(self.child_named(current, segment)?);
        }
        current
    }

    fn data_layout(&self, id: Id) -> Option<ComponentLayout> {
        let layout = |e: Entity| self.layouts.get(&e).copied().filter(|l| !l.is_tag());
        match id {
            Id::Entity(e) => layout(e),
            Id::Pair(p) => layout(p.relation).or_else(|| layout(p.target)),
        }
    }

    fn add(&mut self, entity: Entity, id: Id) -> Result<(), EngineError> {
        self.insert(entity, id, None)
    }

    fn remove(&mut self, entity: Entity, id: Id) -> Result<(), EngineError> {
        let loc = self.location(entity)?;
        let current = self.archetypes[loc.archetype_id.index()].ids();
        if current.binary_search(&id).is_err() {
            return Ok(());
        }
        let ids: Vec<Id> = current.iter().copied().filter(|&i| i != id).collect();
        self.migrate(entity, ids, None)
    }

    fn has(&self, entity: Entity, id: Id) -> bool {
        self.owner_of(entity, id, 0).is_some()
    }

    fn owns(&self, entity: Entity, id: Id) -> bool {
        self.archetype_of(entity).is_some_and(|a| a.has(id))
    }

    fn ids(&self, entity: Entity) -> Result<Vec<Id>, EngineError> {
        let loc = self.location(entity)?;
        Ok(self.archetypes[loc.archetype_id.index()].ids().to_vec())
    }

    fn get(&self, entity: Entity, id: Id) -> Result<Option<&[u8]>, EngineError> {
        self.location(entity)?;
        let Some(owner) = self.owner_of(entity, id, 0) else {
            return Ok(None);
        };
        let loc = self.location(owner)?;
        Ok(self.archetypes[loc.archetype_id.index()].get(id, loc.row))
    }

    fn get_mut(&mut self, entity: Entity, id: Id) -> Result<Option<&mut [u8]>, EngineError> {
        self.location(entity)?;
        match self.owner_of(entity, id, 0) {
            None => return Ok(None),
            Some(owner) if owner != entity => {
                // Override: copy the inherited value into the instance.
                let loc = self.location(owner)?;
                let inherited = self.archetypes[loc.archetype_id.index()]
                    .get(id, loc.row)
                    .map(<[u8]>::to_vec);
                if let Some(bytes) = inherited {
                    self.insert(entity, id, Some(&bytes))?;
                } else {
                    return Ok(None);
                }
            }
            Some(_) => {}
        }
        let loc = self.location(entity)?;
        Ok(self.archetypes[loc.archetype_id.index()].get_mut(id, loc.row))
    }

    fn set(&mut self, entity: Entity, id: Id, bytes: &[u8]) -> Result<(), EngineError> {
        let layout = self.data_layout(id).ok_or(EngineError::NotAComponent { id })?;
        if bytes.len() != layout.size {
            return Err(EngineError::SizeMismatch {
                id,
                expected: layout.size,
                found: bytes.len(),
            });
        }
        let loc = self.location(entity)?;
        match self.archetypes[loc.archetype_id.index()].get_mut(id, loc.row) {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                Ok(())
            }
            None => self.insert(entity, id, Some(bytes)),
        }
    }

    fn bulk_new(&mut self, count: usize, ids: &[Id], columns: &[(Id, &[u8])]) -> Result<Vec<Entity>, EngineError> {
        let mut all: Vec<Id> = ids.iter().copied().chain(columns.iter().map(|(id, _)| *id)).collect();
        all.sort();
        all.dedup();
        for &id in &all {
            self.check_id(id)?;
        }
        let parents = all
            .iter()
            .filter(|id| matches!(id, Id::Pair(p) if p.relation == self.child_of))
            .count();
        if parents > 1 {
            return Err(EngineError::ExclusiveRelation {
                relation: self.child_of,
                count: parents,
            });
        }
        for &(id, bytes) in columns {
            let layout = self.data_layout(id).ok_or(EngineError::NotAComponent { id })?;
            if bytes.len() != layout.size * count {
                return Err(EngineError::SizeMismatch {
                    id,
                    expected: layout.size * count,
                    found: bytes.len(),
                });
            }
        }

        let archetype_id = self.find_or_create_archetype(all)?;
        let entities = self.allocator.allocate_many(count);
        let first = self.archetypes[archetype_id.index()].extend(&entities, columns);
        for (i, &e) in entities.iter().enumerate() {
            self.locations.insert(
                e,
                EntityLocation {
                    archetype_id,
                    row: first + i,
                },
            );
        }
        self.structure_version += 1;
        tracing::debug!(count, archetype = archetype_id.0, "bulk created entities");
        Ok(entities)
    }

    fn child_of(&self) -> Entity {
        self.child_of
    }

    fn is_a(&self) -> Entity {
        self.is_a
    }

    fn prefab(&self) -> Entity {
        self.prefab
    }

    fn compile(&mut self, desc: &FilterDesc) -> Result<MemoryMatcher, EngineError> {
        let mut terms = desc.terms.clone();
        if let Some(src) = desc.expr.as_deref() {
            terms.extend(expr::parse(src, |path| self.lookup(None, path))?);
        }
        for term in &mut terms {
            self.check_id(term.id)?;
            if let TermSource::Entity(src) = term.source {
                self.location(src)?;
            }
            *term = term.resolve_access();
        }
        tracing::debug!(
            name = desc.name.as_deref().unwrap_or(""),
            terms = terms.len(),
            cached = desc.cached,
            "compiled matcher"
        );
        Ok(MemoryMatcher {
            terms,
            instanced: desc.instanced,
            cached: desc.cached,
            matched_at: None,
            groups: Vec::new(),
        })
    }

    fn terms<'m>(&self, matcher: &'m MemoryMatcher) -> &'m [Term] {
        &matcher.terms
    }

    fn iter<'e>(&'e mut self, matcher: &'e mut MemoryMatcher) -> MemoryIter<'e> {
        let fresh = matcher.cached && matcher.matched_at == Some(self.structure_version);
        if !fresh {
            matcher.groups = self.match_groups(&matcher.terms);
            matcher.matched_at = Some(self.structure_version);
            if matcher.cached {
                tracing::trace!(groups = matcher.groups.len(), "rebuilt query cache");
            }
        }
        let matcher: &'e MemoryMatcher = matcher;
        MemoryIter {
            engine: self,
            terms: &matcher.terms,
            groups: &matcher.groups,
            instanced: matcher.instanced,
            next_group: 0,
            step: None,
            columns: Vec::new(),
            set: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// How a term is satisfied within one archetype group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// By the iterated entities themselves.
    Owned,
    /// By another entity, shared by every row.
    Shared(Entity),
    /// Optional or `Not` term with nothing to show.
    Unset,
}

#[derive(Debug, Clone)]
struct Group {
    archetype: Option<ArchetypeId>,
    sources: Vec<Source>,
    shared: bool,
    depth: usize,
}

/// Compiled terms plus the archetype groups they last matched.
#[derive(Debug)]
pub struct MemoryMatcher {
    terms: Vec<Term>,
    instanced: bool,
    cached: bool,
    /// Structure version the groups were matched at.
    matched_at: Option<u64>,
    groups: Vec<Group>,
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Step {
    group: usize,
    offset: usize,
    count: usize,
    split: bool,
}

pub struct MemoryIter<'e> {
    engine: &'e mut MemoryEngine,
    terms: &'e [Term],
    groups: &'e [Group],
    instanced: bool,
    next_group: usize,
    step: Option<Step>,
    columns: Vec<Option<RawColumn>>,
    set: Vec<bool>,
}

impl MemoryIter<'_> {
    fn group_len(&self, group: &Group) -> usize {
        group
            .archetype
            .map_or(0, |a| self.engine.archetypes[a.index()].len())
    }

    fn load(&mut self) {
        self.columns.clear();
        self.set.clear();
        let Some(step) = self.step else {
            return;
        };
        let (terms, groups) = (self.terms, self.groups);
        let group = &groups[step.group];
        for (term, source) in terms.iter().zip(&group.sources) {
            let (column, set) = match *source {
                Source::Unset => (None, false),
                Source::Owned => {
                    let column = group.archetype.and_then(|a| {
                        let archetype = &mut self.engine.archetypes[a.index()];
                        let index = archetype.column_index(term.id)?;
                        let column = archetype.column_at_mut(index);
                        let size = column.item_size();
                        let ptr = column.as_mut_ptr().wrapping_add(step.offset * size);
                        Some(RawColumn {
                            ptr: NonNull::new(ptr)?,
                            len: step.count * size,
                            owned: true,
                        })
                    });
                    (column, true)
                }
                Source::Shared(owner) => {
                    let column = self
                        .engine
                        .column_of(owner, term.id)
                        .map(|(ptr, len)| RawColumn { ptr, len, owned: false });
                    (column, true)
                }
            };
            self.columns.push(column);
            self.set.push(set);
        }
    }
}

impl EngineIter for MemoryIter<'_> {
    fn next(&mut self) -> bool {
        let groups = self.groups;
        if let Some(step) = self.step {
            if step.split && step.offset + 1 < self.group_len(&groups[step.group]) {
                self.step = Some(Step {
                    offset: step.offset + 1,
                    ..step
                });
                self.load();
                return true;
            }
        }
        while self.next_group < groups.len() {
            let index = self.next_group;
            self.next_group += 1;
            let group = &groups[index];
            let len = self.group_len(group);
            if group.archetype.is_some() && len == 0 {
                continue;
            }
            let split = !self.instanced && group.shared && len > 1;
            self.step = Some(Step {
                group: index,
                offset: 0,
                count: if split { 1 } else { len },
                split,
            });
            self.load();
            return true;
        }
        self.step = None;
        self.load();
        false
    }

    fn count(&self) -> usize {
        self.step.map_or(0, |s| s.count)
    }

    fn entities(&self) -> &[Entity] {
        let Some(step) = self.step else {
            return &[];
        };
        match self.groups[step.group].archetype {
            Some(a) => &self.engine.archetypes[a.index()].entities()[step.offset..step.offset + step.count],
            None => &[],
        }
    }

    fn term_count(&self) -> usize {
        self.terms.len()
    }

    fn column(&self, index: usize) -> Option<RawColumn> {
        self.columns.get(index.checked_sub(1)?).copied().flatten()
    }

    fn is_set(&self, index: usize) -> bool {
        index
            .checked_sub(1)
            .and_then(|i| self.set.get(i).copied())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
