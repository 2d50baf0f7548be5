//! Structural edit generator
//!
//! Provides [`StructuralEditor`], which turns domain verbs ("mark this
//! activity at this encounter", "rename this epoch") into minimal patch
//! operation lists. Verbs read the document they are given and never change
//! it; the returned operations are what a draft records.
//!
//! # Invariants
//! - An unknown id fails the verb and no operation is emitted
//! - Applying the returned operations to the same document keeps every
//!   reference resolvable
//! - Entities are addressed by `@id:` paths; positional paths are guarded
//!   by a `test` on the value they expect to find

use protocol_doc::layout::{
    all_ids, items, references_from, INSTANCES, SCHEDULED_ACTIVITY_INSTANCE,
};
use protocol_doc::{Design, DocPath, EntityKind, Located, PatchOperation};
use protocol_integrity::EntityIndex;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Errors raised by edit verbs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    /// Document has no `studyDesigns` entry
    #[error("document has no study design")]
    NoDesign,

    /// Requested design id does not exist
    #[error("study design '{0}' not found")]
    UnknownDesign(String),

    /// Referenced entity does not exist
    #[error("{kind} '{id}' not found")]
    UnknownEntity { kind: EntityKind, id: String },

    /// Schedule edits need a timeline to write into
    #[error("study design has no schedule timeline")]
    NoTimeline,

    /// Ids and reference fields are maintained by the structural verbs
    #[error("field '{field}' of {kind} cannot be edited directly")]
    ProtectedField { kind: EntityKind, field: String },

    /// Field updates only take scalars
    #[error("field '{field}' only accepts scalar values")]
    NonScalarValue { field: String },

    /// Verb does not apply to this kind
    #[error("{verb} is not supported for {kind}")]
    UnsupportedKind { kind: EntityKind, verb: &'static str },

    /// Entity positioned relative to itself
    #[error("cannot position {kind} '{id}' after itself")]
    SelfPosition { kind: EntityKind, id: String },
}

impl EditError {
    /// Stable machine code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoDesign => "no_design",
            Self::UnknownDesign(_) => "unknown_design",
            Self::UnknownEntity { .. } => "unknown_entity",
            Self::NoTimeline => "no_timeline",
            Self::ProtectedField { .. } => "protected_field",
            Self::NonScalarValue { .. } => "non_scalar_value",
            Self::UnsupportedKind { .. } => "unsupported_kind",
            Self::SelfPosition { .. } => "self_position",
        }
    }
}

/// Result of a creation verb
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    /// Freshly allocated id
    pub id: String,
    /// Operations that create and link the entity
    pub operations: Vec<PatchOperation>,
}

/// Domain verb API over one study design
///
/// Targets the first design unless built with [`StructuralEditor::for_design`].
#[derive(Debug, Clone, Default)]
pub struct StructuralEditor {
    design_id: Option<String>,
}

impl StructuralEditor {
    /// Editor for the first study design
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Editor for the design with `id`
    #[must_use]
    pub fn for_design(id: impl Into<String>) -> Self {
        Self {
            design_id: Some(id.into()),
        }
    }

    fn design<'a>(&self, document: &'a Value) -> Result<Design<'a>, EditError> {
        match &self.design_id {
            Some(id) => Design::all(document)
                .into_iter()
                .find(|d| d.id() == Some(id.as_str()))
                .ok_or_else(|| EditError::UnknownDesign(id.clone())),
            None => Design::first(document).ok_or(EditError::NoDesign),
        }
    }

    /// Check whether the schedule cell `(activity, encounter)` is marked
    ///
    /// # Errors
    /// Unknown design, activity or encounter
    pub fn is_marked(
        &self,
        document: &Value,
        activity_id: &str,
        encounter_id: &str,
    ) -> Result<bool, EditError> {
        let design = self.design(document)?;
        require(&design, EntityKind::Activity, activity_id)?;
        require(&design, EntityKind::Encounter, encounter_id)?;
        Ok(design.main_timeline().is_some_and(|timeline| {
            design
                .instances(&timeline)
                .iter()
                .any(|inst| marks(inst, activity_id, encounter_id))
        }))
    }

    /// Mark the schedule cell `(activity, encounter)` on the main timeline
    ///
    /// Extends an instance of the encounter that already schedules other
    /// activities, otherwise creates a new instance. Already-marked cells
    /// yield no operations.
    ///
    /// # Errors
    /// Unknown design, activity or encounter; no timeline to write into
    pub fn set_cell_mark(
        &self,
        document: &Value,
        activity_id: &str,
        encounter_id: &str,
    ) -> Result<Vec<PatchOperation>, EditError> {
        let design = self.design(document)?;
        require(&design, EntityKind::Activity, activity_id)?;
        let encounter = require(&design, EntityKind::Encounter, encounter_id)?;
        let timeline = design.main_timeline().ok_or(EditError::NoTimeline)?;
        let instances = design.instances(&timeline);

        if instances
            .iter()
            .any(|inst| marks(inst, activity_id, encounter_id))
        {
            return Ok(Vec::new());
        }

        // Empty instances are never extended: clearing the cell again would
        // remove an instance this call did not create
        if let Some(inst) = instances.iter().find(|inst| {
            string_field(inst.value, "encounterId") == Some(encounter_id)
                && !items(inst.value, "activityIds").is_empty()
        }) {
            return Ok(vec![
                PatchOperation::test(inst.field("encounterId"), json!(encounter_id)),
                PatchOperation::add(inst.field("activityIds").append(), json!(activity_id)),
            ]);
        }

        let id = fresh_id(document, EntityKind::Instance);
        let mut instance = json!({
            "id": id,
            "instanceType": SCHEDULED_ACTIVITY_INSTANCE,
            "encounterId": encounter_id,
            "activityIds": [activity_id],
        });
        if let Some(epoch) = string_field(encounter.value, "epochId")
            .filter(|epoch| design.find(EntityKind::Epoch, epoch).is_some())
        {
            instance["epochId"] = json!(epoch);
        }

        debug!(instance = %id, activity_id, encounter_id, "scheduling new instance");
        Ok(vec![append_to(&timeline, INSTANCES, instance)])
    }

    /// Unmark the schedule cell `(activity, encounter)` on the main timeline
    ///
    /// Instances left without activities are removed unless something else
    /// refers to them. Unmarked cells yield no operations.
    ///
    /// # Errors
    /// Unknown design, activity or encounter
    pub fn clear_cell(
        &self,
        document: &Value,
        activity_id: &str,
        encounter_id: &str,
    ) -> Result<Vec<PatchOperation>, EditError> {
        let design = self.design(document)?;
        require(&design, EntityKind::Activity, activity_id)?;
        require(&design, EntityKind::Encounter, encounter_id)?;
        let Some(timeline) = design.main_timeline() else {
            return Ok(Vec::new());
        };
        let index = EntityIndex::build(design);

        let mut operations = Vec::new();
        let mut emptied = Vec::new();
        for inst in design.instances(&timeline) {
            if !marks(&inst, activity_id, encounter_id) {
                continue;
            }
            let ids = items(inst.value, "activityIds");
            let only_this = ids.iter().all(|v| v.as_str() == Some(activity_id));
            let referenced = inst
                .id()
                .is_some_and(|id| !index.inbound(EntityKind::Instance, id).is_empty());
            if only_this && !referenced {
                emptied.push(inst);
            } else {
                operations.extend(remove_array_value(
                    &inst.field("activityIds"),
                    ids,
                    activity_id,
                ));
            }
        }
        operations.extend(remove_entities(emptied));
        Ok(operations)
    }

    /// Set an entity's `name`
    ///
    /// # Errors
    /// Unknown design or entity
    pub fn rename_entity(
        &self,
        document: &Value,
        kind: EntityKind,
        id: &str,
        name: &str,
    ) -> Result<Vec<PatchOperation>, EditError> {
        let design = self.design(document)?;
        let entity = require(&design, kind, id)?;
        Ok(set_field(&entity, "name", Some(json!(name))).into_iter().collect())
    }

    /// Replace a scalar field; `null` removes it
    ///
    /// # Errors
    /// Unknown design or entity; `id`, reference and structural fields;
    /// array or object values
    pub fn update_entity_field(
        &self,
        document: &Value,
        kind: EntityKind,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<Vec<PatchOperation>, EditError> {
        let structural = field == "id"
            || (kind == EntityKind::Timeline && field == INSTANCES)
            || references_from(kind).any(|r| r.field == field);
        if structural {
            return Err(EditError::ProtectedField {
                kind,
                field: field.to_string(),
            });
        }
        if value.is_array() || value.is_object() {
            return Err(EditError::NonScalarValue {
                field: field.to_string(),
            });
        }

        let design = self.design(document)?;
        let entity = require(&design, kind, id)?;
        let value = (!value.is_null()).then_some(value);
        Ok(set_field(&entity, field, value).into_iter().collect())
    }

    /// Create an epoch, encounter or activity after `after_id` (or at the end)
    ///
    /// Sequenced kinds are linked into the `previousId`/`nextId` chain at
    /// the new position. Every call allocates a new id.
    ///
    /// # Errors
    /// Unknown design or `after_id`; kinds other than epoch, encounter and
    /// activity
    pub fn add_entity(
        &self,
        document: &Value,
        kind: EntityKind,
        name: &str,
        after_id: Option<&str>,
    ) -> Result<NewEntity, EditError> {
        ensure_ordered_kind(kind, "add_entity")?;
        let design = self.design(document)?;
        let siblings = design.entities(kind);
        let position = match after_id {
            Some(after) => position_of(&siblings, kind, after)? + 1,
            None => siblings.len(),
        };
        let predecessor = position.checked_sub(1).and_then(|p| siblings.get(p));
        let successor = siblings.get(position);

        let id = fresh_id(document, kind);
        let mut entity = json!({"id": id, "name": name});
        if kind.is_sequenced() {
            if let Some(prev) = predecessor.and_then(Located::id) {
                entity["previousId"] = json!(prev);
            }
            if let Some(next) = successor.and_then(Located::id) {
                entity["nextId"] = json!(next);
            }
        }
        if kind == EntityKind::Encounter {
            if let Some(epoch) = predecessor.and_then(|p| string_field(p.value, "epochId")) {
                entity["epochId"] = json!(epoch);
            }
        }

        let collection = design.path().key(kind.collection());
        let mut operations = Vec::new();
        match successor {
            Some(next) => {
                // Positional insert, guarded by the element it lands in front of
                operations.push(PatchOperation::test(
                    collection.index(position),
                    next.value.clone(),
                ));
                operations.push(PatchOperation::add(collection.index(position), entity));
            }
            None if design.value().get(kind.collection()).is_some_and(Value::is_array) => {
                operations.push(PatchOperation::add(collection.append(), entity));
            }
            None => operations.push(PatchOperation::add(collection, json!([entity]))),
        }

        if kind.is_sequenced() {
            if let Some(prev) = predecessor.filter(|p| p.id().is_some()) {
                operations.extend(set_field(prev, "nextId", Some(json!(id))));
            }
            if let Some(next) = successor.filter(|s| s.id().is_some()) {
                operations.extend(set_field(next, "previousId", Some(json!(id))));
            }
        }

        debug!(%kind, id = %id, position, "adding entity");
        Ok(NewEntity { id, operations })
    }

    /// Remove an entity and every reference to it
    ///
    /// Removing an encounter removes the instances scheduled at it. Sequence
    /// neighbours are spliced together.
    ///
    /// # Errors
    /// Unknown design or entity; timelines
    pub fn remove_entity(
        &self,
        document: &Value,
        kind: EntityKind,
        id: &str,
    ) -> Result<Vec<PatchOperation>, EditError> {
        if kind == EntityKind::Timeline {
            return Err(EditError::UnsupportedKind {
                kind,
                verb: "remove_entity",
            });
        }
        let design = self.design(document)?;
        let target = require(&design, kind, id)?;
        let index = EntityIndex::build(design);

        let mut removed = vec![target.clone()];
        if kind == EntityKind::Encounter {
            for inbound in index.inbound(kind, id) {
                if inbound.reference.field == "encounterId" {
                    removed.push(inbound.referrer.clone());
                }
            }
        }
        let is_removed = |entity: &Located<'_>| removed.iter().any(|r| r.path == entity.path);

        let mut operations = Vec::new();
        let mut handled: HashSet<(DocPath, &str)> = HashSet::new();
        for gone in &removed {
            let Some(gone_id) = gone.id() else { continue };
            for inbound in index.inbound(gone.kind, gone_id) {
                let referrer = &inbound.referrer;
                let field = inbound.reference.field;
                if is_removed(referrer) || !handled.insert((referrer.path.clone(), field)) {
                    continue;
                }
                if inbound.reference.many {
                    operations.extend(remove_array_value(
                        &referrer.field(field),
                        items(referrer.value, field),
                        gone_id,
                    ));
                } else {
                    let splice = match field {
                        "nextId" => string_field(gone.value, "nextId"),
                        "previousId" => string_field(gone.value, "previousId"),
                        _ => None,
                    }
                    .filter(|other| Some(*other) != referrer.id());
                    operations.extend(set_field(referrer, field, splice.map(|s| json!(s))));
                }
            }
        }
        operations.extend(remove_entities(removed));

        debug!(%kind, id, operations = operations.len(), "removing entity");
        Ok(operations)
    }

    /// Move an epoch, encounter or activity to just after `after_id`
    ///
    /// `None` moves it to the front. Sequence links of the old and new
    /// neighbours are rewired to follow the new order.
    ///
    /// # Errors
    /// Unknown design, entity or `after_id`; moving after itself;
    /// kinds other than epoch, encounter and activity
    pub fn move_entity(
        &self,
        document: &Value,
        kind: EntityKind,
        id: &str,
        after_id: Option<&str>,
    ) -> Result<Vec<PatchOperation>, EditError> {
        ensure_ordered_kind(kind, "move_entity")?;
        if after_id == Some(id) {
            return Err(EditError::SelfPosition {
                kind,
                id: id.to_string(),
            });
        }
        let design = self.design(document)?;
        let siblings = design.entities(kind);
        let from = position_of(&siblings, kind, id)?;
        let after = after_id
            .map(|after| position_of(&siblings, kind, after))
            .transpose()?;

        let mut order: Vec<usize> = (0..siblings.len()).filter(|&i| i != from).collect();
        let to = after.map_or(0, |a| {
            order.iter().position(|&i| i == a).map_or(0, |p| p + 1)
        });
        if to == from {
            return Ok(Vec::new());
        }
        order.insert(to, from);

        let collection = design.path().key(kind.collection());
        let mut operations = vec![
            PatchOperation::test(collection.index(from).key("id"), json!(id)),
            PatchOperation::move_to(collection.index(from), collection.index(to)),
        ];

        if kind.is_sequenced() {
            let old_neighbours = [from.checked_sub(1), Some(from + 1)];
            let new_neighbours = [to.checked_sub(1), Some(to + 1)];
            let mut affected: Vec<usize> = vec![from];
            for slot in old_neighbours.into_iter().flatten() {
                if slot < siblings.len() {
                    affected.push(slot);
                }
            }
            for slot in new_neighbours.into_iter().flatten() {
                if let Some(&i) = order.get(slot) {
                    affected.push(i);
                }
            }
            affected.sort_unstable();
            affected.dedup();

            let id_at = |p: Option<usize>| {
                p.and_then(|p| order.get(p))
                    .and_then(|&i| siblings[i].id())
                    .map(|s| json!(s))
            };
            for i in affected {
                let entity = &siblings[i];
                if entity.id().is_none() {
                    continue;
                }
                let Some(p) = order.iter().position(|&o| o == i) else {
                    continue;
                };
                operations.extend(set_field(entity, "previousId", id_at(p.checked_sub(1))));
                operations.extend(set_field(entity, "nextId", id_at(Some(p + 1))));
            }
        }

        debug!(%kind, id, from, to, "moving entity");
        Ok(operations)
    }
}

fn require<'a>(design: &Design<'a>, kind: EntityKind, id: &str) -> Result<Located<'a>, EditError> {
    design.find(kind, id).ok_or_else(|| EditError::UnknownEntity {
        kind,
        id: id.to_string(),
    })
}

fn ensure_ordered_kind(kind: EntityKind, verb: &'static str) -> Result<(), EditError> {
    match kind {
        EntityKind::Epoch | EntityKind::Encounter | EntityKind::Activity => Ok(()),
        _ => Err(EditError::UnsupportedKind { kind, verb }),
    }
}

fn position_of(siblings: &[Located<'_>], kind: EntityKind, id: &str) -> Result<usize, EditError> {
    siblings
        .iter()
        .position(|e| e.id() == Some(id))
        .ok_or_else(|| EditError::UnknownEntity {
            kind,
            id: id.to_string(),
        })
}

fn string_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn marks(instance: &Located<'_>, activity_id: &str, encounter_id: &str) -> bool {
    string_field(instance.value, "encounterId") == Some(encounter_id)
        && items(instance.value, "activityIds")
            .iter()
            .any(|v| v.as_str() == Some(activity_id))
}

/// Allocate `<Prefix>_<uuid>` not used anywhere in `document`
fn fresh_id(document: &Value, kind: EntityKind) -> String {
    let taken = all_ids(document);
    loop {
        let id = format!("{}_{}", kind.id_prefix(), Uuid::new_v4().simple());
        if !taken.contains(&id) {
            return id;
        }
    }
}

/// Operation setting (`Some`) or removing (`None`) a field, if it changes
fn set_field(entity: &Located<'_>, field: &str, value: Option<Value>) -> Option<PatchOperation> {
    match (entity.value.get(field), value) {
        (Some(current), Some(value)) if *current == value => None,
        (Some(_), Some(value)) => Some(PatchOperation::replace(entity.field(field), value)),
        (None, Some(value)) => Some(PatchOperation::add(entity.field(field), value)),
        (Some(_), None) => Some(PatchOperation::remove(entity.field(field))),
        (None, None) => None,
    }
}

fn append_to(owner: &Located<'_>, key: &str, element: Value) -> PatchOperation {
    if owner.value.get(key).is_some_and(Value::is_array) {
        PatchOperation::add(owner.field(key).append(), element)
    } else {
        PatchOperation::add(owner.field(key), json!([element]))
    }
}

/// Test-guarded removals of every `value` in an id array, last first
fn remove_array_value(path: &DocPath, current: &[Value], value: &str) -> Vec<PatchOperation> {
    current
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, v)| v.as_str() == Some(value))
        .flat_map(|(i, _)| {
            [
                PatchOperation::test(path.index(i), json!(value)),
                PatchOperation::remove(path.index(i)),
            ]
        })
        .collect()
}

/// Whole-entity removals; positional ones last-first behind a `test`
fn remove_entities(mut entities: Vec<Located<'_>>) -> Vec<PatchOperation> {
    entities.sort_by(|a, b| b.index.cmp(&a.index));
    entities
        .into_iter()
        .flat_map(|entity| match entity.id() {
            Some(_) => vec![PatchOperation::remove(entity.path)],
            None => vec![
                PatchOperation::test(entity.path.clone(), entity.value.clone()),
                PatchOperation::remove(entity.path),
            ],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use protocol_doc::apply;
    use protocol_integrity::validate;

    fn document() -> Value {
        json!({"studyDesigns": [{
            "id": "SD",
            "epochs": [
                {"id": "EP1", "name": "Screening", "nextId": "EP2"},
                {"id": "EP2", "name": "Treatment", "previousId": "EP1"}
            ],
            "encounters": [
                {"id": "E1", "name": "Visit 1", "type": "visit", "epochId": "EP1", "nextId": "E2"},
                {"id": "E2", "name": "Visit 2", "type": "visit", "epochId": "EP2", "previousId": "E1", "nextId": "E3"},
                {"id": "E3", "name": "Visit 3", "type": "visit", "epochId": "EP2", "previousId": "E2"}
            ],
            "activities": [
                {"id": "A1", "name": "Consent"},
                {"id": "A2", "name": "Vitals"},
                {"id": "A3", "name": "Labs"}
            ],
            "scheduleTimelines": [{"id": "T1", "name": "Main", "mainTimeline": true, "entryId": "I1", "instances": [
                {"id": "I1", "instanceType": "ScheduledActivityInstance", "encounterId": "E1",
                 "epochId": "EP1", "activityIds": ["A1", "A2"]},
                {"id": "I2", "instanceType": "ScheduledActivityInstance", "encounterId": "E2",
                 "epochId": "EP2", "activityIds": ["A2"]},
                {"id": "I3", "instanceType": "ScheduledActivityInstance", "encounterId": "E3",
                 "epochId": "EP2", "activityIds": ["A3"]}
            ]}]
        }]})
    }

    fn run(doc: &Value, ops: &[PatchOperation]) -> Value {
        let next = apply(doc, ops).unwrap();
        assert!(validate(&next).valid, "edit broke integrity: {ops:?}");
        next
    }

    fn editor() -> StructuralEditor {
        StructuralEditor::new()
    }

    #[test]
    fn set_cell_mark_extends_existing_instance() {
        let doc = document();
        let ops = editor().set_cell_mark(&doc, "A3", "E1").unwrap();
        assert_eq!(ops.len(), 2);
        let next = run(&doc, &ops);
        assert!(editor().is_marked(&next, "A3", "E1").unwrap());
        assert_eq!(
            next["studyDesigns"][0]["scheduleTimelines"][0]["instances"][0]["activityIds"],
            json!(["A1", "A2", "A3"])
        );
    }

    #[test]
    fn set_cell_mark_creates_instance_when_needed() {
        let mut doc = document();
        doc["studyDesigns"][0]["scheduleTimelines"][0]["instances"]
            .as_array_mut()
            .unwrap()
            .remove(2);
        let ops = editor().set_cell_mark(&doc, "A1", "E3").unwrap();
        let next = run(&doc, &ops);
        let created = &next["studyDesigns"][0]["scheduleTimelines"][0]["instances"][2];
        assert!(created["id"]
            .as_str()
            .unwrap()
            .starts_with("ScheduledActivityInstance_"));
        assert_eq!(created["encounterId"], json!("E3"));
        assert_eq!(created["epochId"], json!("EP2"));
        assert_eq!(created["activityIds"], json!(["A1"]));
    }

    #[test]
    fn set_cell_mark_is_noop_when_marked() {
        let doc = document();
        assert_eq!(editor().set_cell_mark(&doc, "A1", "E1").unwrap(), vec![]);
    }

    #[test]
    fn unknown_ids_emit_nothing() {
        let doc = document();
        let err = editor().set_cell_mark(&doc, "A9", "E1").unwrap_err();
        assert_eq!(
            err,
            EditError::UnknownEntity {
                kind: EntityKind::Activity,
                id: "A9".to_string()
            }
        );
        assert_eq!(err.code(), "unknown_entity");
        assert!(editor().clear_cell(&doc, "A1", "E9").is_err());
        assert!(editor()
            .rename_entity(&doc, EntityKind::Epoch, "EP9", "x")
            .is_err());
        assert!(editor()
            .add_entity(&doc, EntityKind::Epoch, "x", Some("EP9"))
            .is_err());
    }

    #[test]
    fn clear_cell_keeps_shared_instance() {
        let doc = document();
        let ops = editor().clear_cell(&doc, "A2", "E1").unwrap();
        let next = run(&doc, &ops);
        assert_eq!(
            next["studyDesigns"][0]["scheduleTimelines"][0]["instances"][0]["activityIds"],
            json!(["A1"])
        );
    }

    #[test]
    fn clear_cell_removes_emptied_instance() {
        let doc = document();
        let ops = editor().clear_cell(&doc, "A3", "E3").unwrap();
        let next = run(&doc, &ops);
        let instances = next["studyDesigns"][0]["scheduleTimelines"][0]["instances"]
            .as_array()
            .unwrap();
        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn clear_cell_keeps_referenced_instance() {
        // I1 is the timeline entry, so it survives with no activities
        let mut doc = document();
        doc["studyDesigns"][0]["scheduleTimelines"][0]["instances"][0]["activityIds"] =
            json!(["A1"]);
        let ops = editor().clear_cell(&doc, "A1", "E1").unwrap();
        let next = run(&doc, &ops);
        let first = &next["studyDesigns"][0]["scheduleTimelines"][0]["instances"][0];
        assert_eq!(first["id"], json!("I1"));
        assert_eq!(first["activityIds"], json!([]));
    }

    #[test]
    fn set_then_clear_restores_document() {
        let doc = document();
        for (activity, encounter) in [("A3", "E1"), ("A1", "E2"), ("A1", "E1")] {
            let marked = run(&doc, &editor().set_cell_mark(&doc, activity, encounter).unwrap());
            let cleared = run(
                &marked,
                &editor().clear_cell(&marked, activity, encounter).unwrap(),
            );
            if activity == "A1" && encounter == "E1" {
                // Was already marked: clearing removes the original mark
                assert!(!editor().is_marked(&cleared, "A1", "E1").unwrap());
            } else {
                assert_eq!(cleared, doc);
            }
        }
    }

    #[test]
    fn empty_instance_survives_set_then_clear() {
        let mut doc = document();
        doc["studyDesigns"][0]["scheduleTimelines"][0]["instances"][2]["activityIds"] = json!([]);

        let ops = editor().set_cell_mark(&doc, "A1", "E3").unwrap();
        let marked = run(&doc, &ops);
        let instances = &marked["studyDesigns"][0]["scheduleTimelines"][0]["instances"];
        assert_eq!(instances[2]["activityIds"], json!([]));
        assert_eq!(instances[3]["activityIds"], json!(["A1"]));

        let cleared = run(&marked, &editor().clear_cell(&marked, "A1", "E3").unwrap());
        assert_eq!(cleared, doc);
    }

    #[test]
    fn rename_is_idempotent() {
        let doc = document();
        let ops = editor()
            .rename_entity(&doc, EntityKind::Encounter, "E2", "Week 2")
            .unwrap();
        assert_eq!(ops.len(), 1);
        let next = run(&doc, &ops);
        assert_eq!(next["studyDesigns"][0]["encounters"][1]["name"], json!("Week 2"));
        assert_eq!(run(&next, &ops), next);
        assert!(editor()
            .rename_entity(&next, EntityKind::Encounter, "E2", "Week 2")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn update_field_rejects_structural_fields() {
        let doc = document();
        let protected = editor()
            .update_entity_field(&doc, EntityKind::Encounter, "E1", "epochId", json!("EP2"))
            .unwrap_err();
        assert_eq!(protected.code(), "protected_field");
        assert!(editor()
            .update_entity_field(&doc, EntityKind::Activity, "A1", "id", json!("X"))
            .is_err());
        assert_eq!(
            editor()
                .update_entity_field(&doc, EntityKind::Activity, "A1", "label", json!([1]))
                .unwrap_err()
                .code(),
            "non_scalar_value"
        );
    }

    #[test]
    fn update_field_sets_and_removes() {
        let doc = document();
        let ops = editor()
            .update_entity_field(&doc, EntityKind::Activity, "A1", "label", json!("IC"))
            .unwrap();
        let next = run(&doc, &ops);
        assert_eq!(next["studyDesigns"][0]["activities"][0]["label"], json!("IC"));

        let ops = editor()
            .update_entity_field(&next, EntityKind::Activity, "A1", "label", Value::Null)
            .unwrap();
        assert_eq!(run(&next, &ops), doc);
    }

    #[test]
    fn add_encounter_links_neighbours() {
        let doc = document();
        let created = editor()
            .add_entity(&doc, EntityKind::Encounter, "Visit 1b", Some("E1"))
            .unwrap();
        let next = run(&doc, &created.operations);
        let encounters = &next["studyDesigns"][0]["encounters"];
        assert_eq!(encounters[1]["id"], json!(created.id));
        assert_eq!(encounters[1]["previousId"], json!("E1"));
        assert_eq!(encounters[1]["nextId"], json!("E2"));
        assert_eq!(encounters[1]["epochId"], json!("EP1"));
        assert_eq!(encounters[0]["nextId"], json!(created.id));
        assert_eq!(encounters[2]["previousId"], json!(created.id));
    }

    #[test]
    fn add_appends_and_allocates_new_ids() {
        let doc = document();
        let first = editor()
            .add_entity(&doc, EntityKind::Activity, "ECG", None)
            .unwrap();
        let second = editor()
            .add_entity(&doc, EntityKind::Activity, "ECG", None)
            .unwrap();
        assert_ne!(first.id, second.id);
        let next = run(&doc, &first.operations);
        assert_eq!(next["studyDesigns"][0]["activities"][3]["id"], json!(first.id));
    }

    #[test]
    fn add_into_missing_collection() {
        let doc = json!({"studyDesigns": [{"id": "SD"}]});
        let created = editor()
            .add_entity(&doc, EntityKind::Epoch, "Run-in", None)
            .unwrap();
        let next = apply(&doc, &created.operations).unwrap();
        assert_eq!(next["studyDesigns"][0]["epochs"][0]["name"], json!("Run-in"));
        assert!(editor()
            .add_entity(&doc, EntityKind::Instance, "x", None)
            .is_err());
    }

    #[test]
    fn remove_encounter_cascades() {
        let doc = document();
        let ops = editor()
            .remove_entity(&doc, EntityKind::Encounter, "E2")
            .unwrap();
        let next = run(&doc, &ops);
        let design = &next["studyDesigns"][0];
        assert_eq!(design["encounters"].as_array().unwrap().len(), 2);
        assert_eq!(design["encounters"][0]["nextId"], json!("E3"));
        assert_eq!(design["encounters"][1]["previousId"], json!("E1"));
        let instances = design["scheduleTimelines"][0]["instances"].as_array().unwrap();
        assert!(instances.iter().all(|i| i["encounterId"] != json!("E2")));
    }

    #[test]
    fn remove_activity_drops_references() {
        let mut doc = document();
        doc["studyDesigns"][0]["activities"][0]["childIds"] = json!(["A2"]);
        let ops = editor()
            .remove_entity(&doc, EntityKind::Activity, "A2")
            .unwrap();
        let next = run(&doc, &ops);
        let design = &next["studyDesigns"][0];
        assert_eq!(design["activities"][0]["childIds"], json!([]));
        assert_eq!(
            design["scheduleTimelines"][0]["instances"][0]["activityIds"],
            json!(["A1"])
        );
        assert_eq!(
            design["scheduleTimelines"][0]["instances"][1]["activityIds"],
            json!([])
        );
    }

    #[test]
    fn remove_entry_instance_clears_entry() {
        let doc = document();
        let ops = editor()
            .remove_entity(&doc, EntityKind::Instance, "I1")
            .unwrap();
        let next = run(&doc, &ops);
        assert!(next["studyDesigns"][0]["scheduleTimelines"][0]
            .get("entryId")
            .is_none());
    }

    #[test]
    fn move_epoch_rewires_chain() {
        let doc = document();
        let ops = editor()
            .move_entity(&doc, EntityKind::Epoch, "EP2", None)
            .unwrap();
        let next = run(&doc, &ops);
        let epochs = &next["studyDesigns"][0]["epochs"];
        assert_eq!(epochs[0]["id"], json!("EP2"));
        assert_eq!(epochs[0]["nextId"], json!("EP1"));
        assert!(epochs[0].get("previousId").is_none());
        assert_eq!(epochs[1]["previousId"], json!("EP2"));
        assert!(epochs[1].get("nextId").is_none());
    }

    #[test]
    fn move_encounter_to_end() {
        let doc = document();
        let ops = editor()
            .move_entity(&doc, EntityKind::Encounter, "E1", Some("E3"))
            .unwrap();
        let next = run(&doc, &ops);
        let order: Vec<_> = next["studyDesigns"][0]["encounters"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["E2", "E3", "E1"]);
        let encounters = &next["studyDesigns"][0]["encounters"];
        assert!(encounters[0].get("previousId").is_none());
        assert_eq!(encounters[1]["nextId"], json!("E1"));
        assert_eq!(encounters[2]["previousId"], json!("E3"));
        assert!(encounters[2].get("nextId").is_none());
    }

    #[test]
    fn move_to_same_place_is_noop() {
        let doc = document();
        assert!(editor()
            .move_entity(&doc, EntityKind::Activity, "A2", Some("A1"))
            .unwrap()
            .is_empty());
        assert_eq!(
            editor()
                .move_entity(&doc, EntityKind::Activity, "A2", Some("A2"))
                .unwrap_err()
                .code(),
            "self_position"
        );
    }

    #[test]
    fn schedule_edits_need_a_timeline() {
        let mut doc = document();
        doc["studyDesigns"][0]
            .as_object_mut()
            .unwrap()
            .remove("scheduleTimelines");
        assert_eq!(
            editor().set_cell_mark(&doc, "A1", "E1").unwrap_err(),
            EditError::NoTimeline
        );
        assert!(editor().clear_cell(&doc, "A1", "E1").unwrap().is_empty());
    }

    #[test]
    fn design_selection() {
        let doc = document();
        assert!(StructuralEditor::for_design("SD")
            .set_cell_mark(&doc, "A3", "E1")
            .is_ok());
        assert_eq!(
            StructuralEditor::for_design("OTHER")
                .set_cell_mark(&doc, "A3", "E1")
                .unwrap_err(),
            EditError::UnknownDesign("OTHER".to_string())
        );
        assert_eq!(
            editor().set_cell_mark(&json!({}), "A", "E").unwrap_err(),
            EditError::NoDesign
        );
    }
}
