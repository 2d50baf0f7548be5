//! Referential integrity checker
//!
//! Walks a candidate document and reports:
//! - dangling references (error): an id in a reference field that resolves
//!   to no entity of the expected kind
//! - duplicate ids (error): two objects anywhere carrying the same `id`
//! - orphaned entities (warning): encounters no instance schedules, and
//!   activities that are neither scheduled nor part of a group
//! - classification gaps: ungrouped activities while grouping is in use
//!   (warning), encounters without a `type` (info)

use crate::index::EntityIndex;
use crate::issue::{IntegrityIssue, IntegrityReport, Severity};
use protocol_doc::layout::{visit_ids, REFERENCES};
use protocol_doc::{Design, DocPath, EntityKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Which advisory checks to run
///
/// Dangling references and duplicate ids are always checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Report orphaned encounters and activities
    pub report_orphans: bool,
    /// Report classification gaps
    pub report_classification: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            report_orphans: true,
            report_classification: true,
        }
    }
}

/// Integrity checker
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityChecker {
    config: CheckerConfig,
}

impl IntegrityChecker {
    /// Create checker with default config
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create checker with custom config
    #[inline]
    #[must_use]
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    /// Check `document`
    #[must_use]
    pub fn check(&self, document: &Value) -> IntegrityReport {
        let mut issues = duplicate_ids(document);

        for design in Design::all(document) {
            let index = EntityIndex::build(design);
            dangling_references(&index, &mut issues);
            if self.config.report_orphans {
                orphans(&index, &mut issues);
            }
            if self.config.report_classification {
                classification_gaps(&index, &mut issues);
            }
        }

        let report = IntegrityReport::from_issues(issues);
        debug!(valid = report.valid, summary = %report.summary(), "integrity check complete");
        report
    }
}

/// Check `document` with the default configuration
#[must_use]
pub fn validate(document: &Value) -> IntegrityReport {
    IntegrityChecker::new().check(document)
}

fn duplicate_ids(document: &Value) -> Vec<IntegrityIssue> {
    let mut first_seen: HashMap<String, String> = HashMap::new();
    let mut issues = Vec::new();
    visit_ids(document, &DocPath::root(), &mut |id, path| {
        let path = path.to_string();
        match first_seen.get(id) {
            Some(first) => issues.push(IntegrityIssue::duplicate(path, id, first)),
            None => {
                first_seen.insert(id.to_string(), path);
            }
        }
    });
    issues
}

fn dangling_references(index: &EntityIndex<'_>, issues: &mut Vec<IntegrityIssue>) {
    let design = index.design();
    for reference in REFERENCES {
        for referrer in design.entities(reference.referrer) {
            for target in reference.targets(referrer.value) {
                if index.resolves(reference, &referrer, target) {
                    continue;
                }
                let scope = if reference.same_timeline {
                    "in the same timeline"
                } else {
                    "in the design"
                };
                issues.push(IntegrityIssue::dangling(
                    referrer.field(reference.field).to_string(),
                    referrer.id(),
                    target,
                    format!(
                        "{} {} references {} '{target}' which does not exist {scope}",
                        reference.referrer,
                        reference.field,
                        reference.target
                    ),
                ));
            }
        }
    }
}

fn orphans(index: &EntityIndex<'_>, issues: &mut Vec<IntegrityIssue>) {
    for encounter in index.entities(EntityKind::Encounter) {
        let Some(id) = encounter.id() else { continue };
        if !index.is_referenced_by(EntityKind::Encounter, id, "encounterId") {
            issues.push(IntegrityIssue::orphan(
                encounter.path.to_string(),
                id,
                format!("encounter '{id}' is not scheduled by any instance"),
            ));
        }
    }

    for activity in index.entities(EntityKind::Activity) {
        let Some(id) = activity.id() else { continue };
        let scheduled = index.is_referenced_by(EntityKind::Activity, id, "activityIds");
        let is_child = index.is_referenced_by(EntityKind::Activity, id, "childIds");
        if !scheduled && !is_child && !has_children(activity.value) {
            issues.push(IntegrityIssue::orphan(
                activity.path.to_string(),
                id,
                format!("activity '{id}' is not scheduled and belongs to no group"),
            ));
        }
    }
}

fn classification_gaps(index: &EntityIndex<'_>, issues: &mut Vec<IntegrityIssue>) {
    let grouping_in_use = index
        .entities(EntityKind::Activity)
        .any(|activity| has_children(activity.value));

    if grouping_in_use {
        for activity in index.entities(EntityKind::Activity) {
            let Some(id) = activity.id() else { continue };
            if has_children(activity.value)
                || index.is_referenced_by(EntityKind::Activity, id, "childIds")
            {
                continue;
            }
            issues.push(IntegrityIssue::gap(
                Severity::Warning,
                activity.path.to_string(),
                id,
                format!("activity '{id}' is not assigned to any group"),
            ));
        }
    }

    for encounter in index.entities(EntityKind::Encounter) {
        let Some(id) = encounter.id() else { continue };
        if encounter.value.get("type").map_or(true, Value::is_null) {
            issues.push(IntegrityIssue::gap(
                Severity::Info,
                encounter.path.to_string(),
                id,
                format!("encounter '{id}' has no type"),
            ));
        }
    }
}

fn has_children(activity: &Value) -> bool {
    activity
        .get("childIds")
        .and_then(Value::as_array)
        .is_some_and(|ids| !ids.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn document() -> Value {
        json!({"studyDesigns": [{
            "id": "SD",
            "epochs": [{"id": "EP1", "name": "Treatment"}],
            "encounters": [{"id": "E1", "name": "Day 1", "type": "visit", "epochId": "EP1"}],
            "activities": [{"id": "A1", "name": "Vitals"}],
            "scheduleTimelines": [{"id": "T1", "mainTimeline": true, "entryId": "I1", "instances": [
                {"id": "I1", "instanceType": "ScheduledActivityInstance",
                 "encounterId": "E1", "epochId": "EP1", "activityIds": ["A1"]}
            ]}]
        }]})
    }

    fn strict() -> IntegrityChecker {
        IntegrityChecker::with_config(CheckerConfig {
            report_orphans: false,
            report_classification: false,
        })
    }

    #[test]
    fn clean_document_has_no_issues() {
        let report = validate(&document());
        assert!(report.valid);
        assert_eq!(report.issues, vec![]);
    }

    #[test]
    fn dangling_activity_reference() {
        let mut doc = document();
        doc["studyDesigns"][0]["scheduleTimelines"][0]["instances"][0]["activityIds"] =
            json!(["A1", "A_MISSING"]);
        let report = strict().check(&doc);
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 1);
        let issue = &report.issues[0];
        assert_eq!(issue.kind, IssueKind::DanglingReference);
        assert_eq!(issue.referenced_id.as_deref(), Some("A_MISSING"));
        assert_eq!(issue.entity_id.as_deref(), Some("I1"));
        assert_eq!(
            issue.path,
            "/studyDesigns/@id:SD/scheduleTimelines/@id:T1/instances/@id:I1/activityIds"
        );
    }

    #[test]
    fn wrong_kind_is_dangling() {
        let mut doc = document();
        doc["studyDesigns"][0]["encounters"][0]["epochId"] = json!("A1");
        let report = strict().check(&doc);
        assert_eq!(report.of_kind(IssueKind::DanglingReference).count(), 1);
    }

    #[test]
    fn entry_must_live_in_same_timeline() {
        let mut doc = document();
        doc["studyDesigns"][0]["scheduleTimelines"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "T2", "entryId": "I1", "instances": []}));
        let report = strict().check(&doc);
        let issues: Vec<_> = report.of_kind(IssueKind::DanglingReference).collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].entity_id.as_deref(), Some("T2"));
    }

    #[test]
    fn duplicate_ids_anywhere() {
        let mut doc = document();
        doc["studyDesigns"][0]["activities"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "E1", "name": "clash"}));
        let report = strict().check(&doc);
        let dupes: Vec<_> = report.of_kind(IssueKind::DuplicateId).collect();
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].entity_id.as_deref(), Some("E1"));
        assert!(!report.valid);
    }

    #[test]
    fn orphans_are_warnings() {
        let mut doc = document();
        let design = &mut doc["studyDesigns"][0];
        design["encounters"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "E2", "name": "Day 8", "type": "visit"}));
        design["activities"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "A2", "name": "Labs"}));
        let report = validate(&doc);
        assert!(report.valid);
        let orphaned: Vec<_> = report
            .of_kind(IssueKind::OrphanedEntity)
            .filter_map(|i| i.entity_id.as_deref())
            .collect();
        assert_eq!(orphaned, vec!["E2", "A2"]);
    }

    #[test]
    fn classification_gaps() {
        let mut doc = document();
        let design = &mut doc["studyDesigns"][0];
        design["encounters"][0]
            .as_object_mut()
            .unwrap()
            .remove("type");
        design["activities"] = json!([
            {"id": "A1", "name": "Vitals"},
            {"id": "G1", "name": "Safety", "childIds": ["A3"]},
            {"id": "A3", "name": "ECG"}
        ]);
        let report = validate(&doc);
        let gaps: Vec<_> = report
            .of_kind(IssueKind::ClassificationGap)
            .map(|i| (i.severity, i.entity_id.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(gaps, vec![(Severity::Warning, "A1"), (Severity::Info, "E1")]);
    }
}
