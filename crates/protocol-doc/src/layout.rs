//! Entity layout
//!
//! Provides [`EntityKind`], the reference table between kinds, and
//! [`Design`], a read-only view over one `/studyDesigns/<n>` subtree. The
//! rest of a protocol document is opaque; only the collections named here
//! carry entities that reference each other by id.

use crate::pointer::DocPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

/// Top-level array holding study designs
pub const DESIGNS: &str = "studyDesigns";

/// Per-timeline array holding scheduled instances
pub const INSTANCES: &str = "instances";

/// `instanceType` of instances created for schedule cells
pub const SCHEDULED_ACTIVITY_INSTANCE: &str = "ScheduledActivityInstance";

/// Kinds of entity the system knows how to address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Study period (`epochs[]`)
    Epoch,
    /// Visit (`encounters[]`)
    Encounter,
    /// Procedure or assessment (`activities[]`)
    Activity,
    /// Schedule timeline (`scheduleTimelines[]`)
    Timeline,
    /// Scheduled instance (`scheduleTimelines[].instances[]`)
    Instance,
}

impl EntityKind {
    /// Every kind, in layout order
    pub const ALL: [Self; 5] = [
        Self::Epoch,
        Self::Encounter,
        Self::Activity,
        Self::Timeline,
        Self::Instance,
    ];

    /// Name of the array holding this kind
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Epoch => "epochs",
            Self::Encounter => "encounters",
            Self::Activity => "activities",
            Self::Timeline => "scheduleTimelines",
            Self::Instance => INSTANCES,
        }
    }

    /// Prefix of freshly generated ids
    #[must_use]
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Epoch => "Epoch",
            Self::Encounter => "Encounter",
            Self::Activity => "Activity",
            Self::Timeline => "ScheduleTimeline",
            Self::Instance => "ScheduledActivityInstance",
        }
    }

    /// Kinds linked into a chain through `previousId` / `nextId`
    #[inline]
    #[must_use]
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::Epoch | Self::Encounter)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Epoch => "epoch",
            Self::Encounter => "encounter",
            Self::Activity => "activity",
            Self::Timeline => "timeline",
            Self::Instance => "instance",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the reference table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Kind holding the reference
    pub referrer: EntityKind,
    /// Field name on the referrer
    pub field: &'static str,
    /// Kind the id must resolve to
    pub target: EntityKind,
    /// Field is an array of ids
    pub many: bool,
    /// Target must live in the referrer's own timeline
    pub same_timeline: bool,
}

impl Reference {
    const fn one(referrer: EntityKind, field: &'static str, target: EntityKind) -> Self {
        Self {
            referrer,
            field,
            target,
            many: false,
            same_timeline: false,
        }
    }

    const fn many(referrer: EntityKind, field: &'static str, target: EntityKind) -> Self {
        Self {
            referrer,
            field,
            target,
            many: true,
            same_timeline: false,
        }
    }

    const fn local(referrer: EntityKind, field: &'static str) -> Self {
        Self {
            referrer,
            field,
            target: EntityKind::Instance,
            many: false,
            same_timeline: true,
        }
    }

    /// Ids referenced by `entity` through this field
    ///
    /// Null and absent fields reference nothing; non-string members are
    /// ignored.
    #[must_use]
    pub fn targets<'a>(&self, entity: &'a Value) -> Vec<&'a str> {
        match entity.get(self.field) {
            Some(Value::String(id)) if !self.many => vec![id.as_str()],
            Some(Value::Array(ids)) if self.many => ids.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// Every id reference the layout defines
pub const REFERENCES: &[Reference] = &[
    Reference::one(EntityKind::Instance, "encounterId", EntityKind::Encounter),
    Reference::one(EntityKind::Instance, "epochId", EntityKind::Epoch),
    Reference::many(EntityKind::Instance, "activityIds", EntityKind::Activity),
    Reference::one(EntityKind::Instance, "timelineId", EntityKind::Timeline),
    Reference::local(EntityKind::Instance, "defaultConditionId"),
    Reference::local(EntityKind::Timeline, "entryId"),
    Reference::many(EntityKind::Activity, "childIds", EntityKind::Activity),
    Reference::one(EntityKind::Activity, "timelineId", EntityKind::Timeline),
    Reference::one(EntityKind::Encounter, "epochId", EntityKind::Epoch),
    Reference::one(EntityKind::Encounter, "previousId", EntityKind::Encounter),
    Reference::one(EntityKind::Encounter, "nextId", EntityKind::Encounter),
    Reference::one(EntityKind::Epoch, "previousId", EntityKind::Epoch),
    Reference::one(EntityKind::Epoch, "nextId", EntityKind::Epoch),
];

/// References held by entities of `kind`
pub fn references_from(kind: EntityKind) -> impl Iterator<Item = &'static Reference> {
    REFERENCES.iter().filter(move |r| r.referrer == kind)
}

/// References that point at entities of `kind`
pub fn references_to(kind: EntityKind) -> impl Iterator<Item = &'static Reference> {
    REFERENCES.iter().filter(move |r| r.target == kind)
}

/// Array under `key`, or an empty slice when absent or not an array
#[must_use]
pub fn items<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// String `id` of an object
#[inline]
#[must_use]
pub fn id_of(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// An entity found in a document, with an address a patch can use
#[derive(Debug, Clone, PartialEq)]
pub struct Located<'a> {
    /// Entity kind
    pub kind: EntityKind,
    /// Entity object
    pub value: &'a Value,
    /// Position within its array
    pub index: usize,
    /// Id-addressed path when the entity has an id, positional otherwise
    pub path: DocPath,
    /// Owning timeline id, for instances
    pub timeline_id: Option<&'a str>,
}

impl<'a> Located<'a> {
    /// Entity id
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&'a str> {
        id_of(self.value)
    }

    /// Path of a field on this entity
    #[must_use]
    pub fn field(&self, name: &str) -> DocPath {
        self.path.key(name)
    }
}

/// Read-only view of one study design
#[derive(Debug, Clone, Copy)]
pub struct Design<'a> {
    index: usize,
    value: &'a Value,
}

impl<'a> Design<'a> {
    /// Every design in the document
    #[must_use]
    pub fn all(document: &'a Value) -> Vec<Self> {
        items(document, DESIGNS)
            .iter()
            .enumerate()
            .map(|(index, value)| Self { index, value })
            .collect()
    }

    /// First design, if any
    #[must_use]
    pub fn first(document: &'a Value) -> Option<Self> {
        items(document, DESIGNS)
            .first()
            .map(|value| Self { index: 0, value })
    }

    /// Position in `studyDesigns`
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Design id
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&'a str> {
        id_of(self.value)
    }

    /// Design object
    #[inline]
    #[must_use]
    pub fn value(&self) -> &'a Value {
        self.value
    }

    /// Path of the design
    #[must_use]
    pub fn path(&self) -> DocPath {
        let designs = DocPath::root().key(DESIGNS);
        match self.id() {
            Some(id) => designs.id(id),
            None => designs.index(self.index),
        }
    }

    /// Path of the array holding `kind`
    ///
    /// Instances live per timeline, so for [`EntityKind::Instance`] this is
    /// the main timeline's array (or `None` without a timeline).
    #[must_use]
    pub fn collection_path(&self, kind: EntityKind) -> Option<DocPath> {
        match kind {
            EntityKind::Instance => self.main_timeline().map(|t| t.field(INSTANCES)),
            other => Some(self.path().key(other.collection())),
        }
    }

    /// Entities of `kind` held directly by the design
    ///
    /// Instances are listed across every timeline.
    #[must_use]
    pub fn entities(&self, kind: EntityKind) -> Vec<Located<'a>> {
        if kind == EntityKind::Instance {
            return self
                .entities(EntityKind::Timeline)
                .iter()
                .flat_map(|timeline| self.instances(timeline))
                .collect();
        }
        let base = self.path().key(kind.collection());
        items(self.value, kind.collection())
            .iter()
            .enumerate()
            .map(|(index, value)| Located {
                kind,
                value,
                index,
                path: element_path(&base, index, value),
                timeline_id: None,
            })
            .collect()
    }

    /// Instances held by `timeline`
    #[must_use]
    pub fn instances(&self, timeline: &Located<'a>) -> Vec<Located<'a>> {
        let base = timeline.field(INSTANCES);
        let owner = timeline.id();
        items(timeline.value, INSTANCES)
            .iter()
            .enumerate()
            .map(|(index, value)| Located {
                kind: EntityKind::Instance,
                value,
                index,
                path: element_path(&base, index, value),
                timeline_id: owner,
            })
            .collect()
    }

    /// Find an entity by kind and id
    #[must_use]
    pub fn find(&self, kind: EntityKind, id: &str) -> Option<Located<'a>> {
        self.entities(kind)
            .into_iter()
            .find(|entity| entity.id() == Some(id))
    }

    /// The timeline flagged `mainTimeline: true`, else the first one
    #[must_use]
    pub fn main_timeline(&self) -> Option<Located<'a>> {
        let timelines = self.entities(EntityKind::Timeline);
        let flagged = timelines
            .iter()
            .position(|t| t.value.get("mainTimeline").and_then(Value::as_bool) == Some(true));
        timelines.into_iter().nth(flagged.unwrap_or(0))
    }
}

fn element_path(base: &DocPath, index: usize, value: &Value) -> DocPath {
    match id_of(value) {
        Some(id) => base.id(id),
        None => base.index(index),
    }
}

/// Every string `id` anywhere in the document
#[must_use]
pub fn all_ids(document: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    visit_ids(document, &DocPath::root(), &mut |id, _| {
        ids.insert(id.to_string());
    });
    ids
}

/// Visit every object carrying a string `id`, with its positional path
///
/// Visiting is depth-first in document order.
pub fn visit_ids<F>(value: &Value, path: &DocPath, visit: &mut F)
where
    F: FnMut(&str, &DocPath),
{
    match value {
        Value::Object(map) => {
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                visit(id, path);
            }
            for (key, child) in map {
                visit_ids(child, &path.key(key.as_str()), visit);
            }
        }
        Value::Array(elements) => {
            for (index, child) in elements.iter().enumerate() {
                visit_ids(child, &path.index(index), visit);
            }
        }
        _ => {}
    }
}
