//! User-defined JSON reports collected from run artifacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{Artifact, WorkflowReport};

/// Raw custom-report artifacts of one or more runs, keyed by report name.
pub type CustomReportArtifacts = BTreeMap<String, Vec<Artifact>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReport {
    pub workflow_id: String,
    pub workflow_run_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CustomReport {
    /// Tags `fields` with the run identity; the tags replace same-named user keys.
    pub fn new(workflow: &WorkflowReport, mut fields: Map<String, Value>) -> Self {
        for key in ["workflowId", "workflowRunId", "createdAt"] {
            fields.remove(key);
        }
        Self {
            workflow_id: workflow.workflow_id.clone(),
            workflow_run_id: workflow.workflow_run_id.clone(),
            created_at: workflow.created_at,
            fields,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomReportCollection {
    reports: BTreeMap<String, Vec<CustomReport>>,
}

impl CustomReportCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[CustomReport]> {
        self.reports.get(name).map(Vec::as_slice)
    }

    pub fn push(&mut self, name: &str, report: CustomReport) {
        self.reports.entry(name.to_string()).or_default().push(report);
    }

    /// Appends `other` after the reports already held, name by name.
    pub fn aggregate(&mut self, other: CustomReportCollection) {
        for (name, reports) in other.reports {
            self.reports.entry(name).or_default().extend(reports);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CustomReport])> {
        self.reports
            .iter()
            .map(|(name, reports)| (name.as_str(), reports.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.reports.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.reports.values().map(Vec::len).sum()
    }
}

/// Concatenates same-named artifact lists in input order.
pub fn aggregate_custom_report_artifacts(
    maps: impl IntoIterator<Item = CustomReportArtifacts>,
) -> CustomReportArtifacts {
    let mut merged = CustomReportArtifacts::new();
    for map in maps {
        for (name, artifacts) in map {
            merged.entry(name).or_default().extend(artifacts);
        }
    }
    merged
}

/// Parses every artifact as a JSON object or an array of objects.
///
/// Malformed artifacts and non-object array elements are logged and skipped.
pub fn create_custom_report_collection(
    workflow: &WorkflowReport,
    artifacts: &CustomReportArtifacts,
) -> CustomReportCollection {
    let mut collection = CustomReportCollection::new();
    for (name, artifacts) in artifacts {
        for artifact in artifacts {
            let value: Value = match serde_json::from_slice(&artifact.data) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        report = %name,
                        path = %artifact.path,
                        workflow_run_id = %workflow.workflow_run_id,
                        "skipping custom report artifact with invalid JSON: {err}"
                    );
                    continue;
                }
            };
            let objects = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            for object in objects {
                match object {
                    Value::Object(fields) => collection.push(name, CustomReport::new(workflow, fields)),
                    other => warn!(
                        report = %name,
                        path = %artifact.path,
                        "skipping non-object custom report entry: {other}"
                    ),
                }
            }
        }
    }
    collection
}
