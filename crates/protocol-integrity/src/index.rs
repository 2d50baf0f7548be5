//! Entity index
//!
//! Provides [`EntityIndex`], a per-design lookup of entities by kind and id
//! together with the inverse of every reference in the layout table.

use indexmap::{IndexMap, IndexSet};
use protocol_doc::layout::{Reference, REFERENCES};
use protocol_doc::{Design, DocPath, EntityKind, Located};
use std::collections::HashMap;

/// A reference pointing at an entity
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound<'a> {
    /// Entity holding the reference
    pub referrer: Located<'a>,
    /// Reference table row
    pub reference: &'static Reference,
}

impl Inbound<'_> {
    /// Path of the referencing field
    #[must_use]
    pub fn field_path(&self) -> DocPath {
        self.referrer.field(self.reference.field)
    }
}

/// Lookup tables over one design
#[derive(Debug, Clone)]
pub struct EntityIndex<'a> {
    design: Design<'a>,
    entities: HashMap<EntityKind, IndexMap<&'a str, Located<'a>>>,
    timeline_members: HashMap<&'a str, IndexSet<&'a str>>,
    inbound: HashMap<EntityKind, HashMap<&'a str, Vec<Inbound<'a>>>>,
}

impl<'a> EntityIndex<'a> {
    /// Index every entity of `design`
    ///
    /// Entities without an id are skipped. When an id repeats within a
    /// kind, the first occurrence wins.
    #[must_use]
    pub fn build(design: Design<'a>) -> Self {
        let mut entities: HashMap<EntityKind, IndexMap<&'a str, Located<'a>>> = HashMap::new();
        let mut timeline_members: HashMap<&'a str, IndexSet<&'a str>> = HashMap::new();

        for kind in EntityKind::ALL {
            for entity in design.entities(kind) {
                let Some(id) = entity.id() else { continue };
                if let (EntityKind::Instance, Some(timeline)) = (kind, entity.timeline_id) {
                    timeline_members.entry(timeline).or_default().insert(id);
                }
                entities
                    .entry(kind)
                    .or_default()
                    .entry(id)
                    .or_insert(entity);
            }
        }

        let mut inbound: HashMap<EntityKind, HashMap<&'a str, Vec<Inbound<'a>>>> = HashMap::new();
        for reference in REFERENCES {
            for referrer in design.entities(reference.referrer) {
                for target in reference.targets(referrer.value) {
                    inbound
                        .entry(reference.target)
                        .or_default()
                        .entry(target)
                        .or_default()
                        .push(Inbound {
                            referrer: referrer.clone(),
                            reference,
                        });
                }
            }
        }

        Self {
            design,
            entities,
            timeline_members,
            inbound,
        }
    }

    /// Design this index covers
    #[inline]
    #[must_use]
    pub fn design(&self) -> Design<'a> {
        self.design
    }

    /// Look up an entity
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Located<'a>> {
        self.entities.get(&kind)?.get(id)
    }

    /// Check if an entity exists
    #[inline]
    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    /// Check if `timeline` holds an instance with `id`
    #[must_use]
    pub fn timeline_contains(&self, timeline: &str, id: &str) -> bool {
        self.timeline_members
            .get(timeline)
            .is_some_and(|members| members.contains(id))
    }

    /// Entities of `kind`, in document order
    pub fn entities(&self, kind: EntityKind) -> impl Iterator<Item = &Located<'a>> {
        self.entities.get(&kind).into_iter().flat_map(IndexMap::values)
    }

    /// References pointing at an entity, in table then document order
    #[must_use]
    pub fn inbound(&self, kind: EntityKind, id: &str) -> &[Inbound<'a>] {
        self.inbound
            .get(&kind)
            .and_then(|by_id| by_id.get(id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Check if anything refers to an entity through `field`
    #[must_use]
    pub fn is_referenced_by(&self, kind: EntityKind, id: &str, field: &str) -> bool {
        self.inbound(kind, id)
            .iter()
            .any(|r| r.reference.field == field)
    }

    /// Check whether a reference target resolves
    ///
    /// Same-timeline references only resolve within the referrer's own
    /// timeline.
    #[must_use]
    pub fn resolves(&self, reference: &Reference, referrer: &Located<'_>, target: &str) -> bool {
        if !reference.same_timeline {
            return self.contains(reference.target, target);
        }
        let owner = match referrer.kind {
            EntityKind::Timeline => referrer.id(),
            _ => referrer.timeline_id,
        };
        owner.is_some_and(|timeline| self.timeline_contains(timeline, target))
    }
}
