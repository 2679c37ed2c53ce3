//! Goal catalog - maps a named search goal to its endpoint and parameters
//!
//! Loaded once at startup and handed to the pipeline; read-only afterwards.

use crate::error::{IngestError, Result, ValidationError};
use crate::ingestion::fetcher::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSpec {
    /// Endpoint path relative to the API base URL
    pub endpoint: String,
    /// Required parameter names, in the order they are sent
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub envelope: Envelope,
}

impl GoalSpec {
    pub fn new(endpoint: &str, parameters: &[&str]) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            envelope: Envelope::Data,
        }
    }

    pub fn requires(&self, param: &str) -> bool {
        self.parameters.iter().any(|p| p == param)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalCatalog {
    goals: BTreeMap<String, GoalSpec>,
}

impl GoalCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read goal catalog {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json_str(&content)?;
        info!("Loaded {} goals from {}", catalog.goals.len(), path.display());
        Ok(catalog)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let catalog: GoalCatalog = serde_json::from_str(content)?;
        if let Some((name, _)) = catalog.goals.iter().find(|(_, g)| g.endpoint.trim().is_empty()) {
            return Err(IngestError::Config(format!("goal '{}' has an empty endpoint", name)));
        }
        Ok(catalog)
    }

    /// The EPA AQS goals the tool ships with.
    pub fn aqs_default() -> Self {
        let goals = [
            ("States", GoalSpec::new("list/states", &[])),
            ("Counties", GoalSpec::new("list/countiesByState", &["state"])),
            ("Sites", GoalSpec::new("list/sitesByCounty", &["state", "county"])),
            ("Parameter Classes", GoalSpec::new("list/classes", &[])),
            ("Parameters", GoalSpec::new("list/parametersByClass", &["pc"])),
            (
                "Monitors by County",
                GoalSpec::new("monitors/byCounty", &["param", "bdate", "edate", "state", "county"]),
            ),
            (
                "Sample Data by County",
                GoalSpec::new("sampleData/byCounty", &["param", "bdate", "edate", "state", "county"]),
            ),
            (
                "Sample Data by State",
                GoalSpec::new("sampleData/byState", &["param", "bdate", "edate", "state"]),
            ),
            (
                "Daily Data by County",
                GoalSpec::new("dailyData/byCounty", &["param", "bdate", "edate", "state", "county"]),
            ),
            (
                "Quarterly by County",
                GoalSpec::new("quarterlyData/byCounty", &["param", "bdate", "edate", "state", "county"]),
            ),
            (
                "Annual by County",
                GoalSpec::new("annualData/byCounty", &["param", "bdate", "edate", "state", "county"]),
            ),
        ];

        Self {
            goals: goals
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: GoalSpec) {
        self.goals.insert(name.into(), spec);
    }

    pub fn get(&self, goal: &str) -> std::result::Result<&GoalSpec, ValidationError> {
        self.goals
            .get(goal)
            .ok_or_else(|| ValidationError::UnknownGoal(goal.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.goals.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog() {
        let catalog = GoalCatalog::from_json_str(
            r#"{
                "Counties": {"endpoint": "list/countiesByState", "parameters": ["state"]},
                "ACS Profile": {"endpoint": "acs/acs5/profile", "envelope": "header_row"}
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("Counties").unwrap().parameters, vec!["state"]);
        assert_eq!(catalog.get("ACS Profile").unwrap().envelope, Envelope::HeaderRow);
        assert!(catalog.get("ACS Profile").unwrap().parameters.is_empty());
    }

    #[test]
    fn test_unknown_goal() {
        let catalog = GoalCatalog::aqs_default();
        assert_eq!(
            catalog.get("Hourly").unwrap_err(),
            ValidationError::UnknownGoal("Hourly".to_string())
        );
        assert!(catalog.get("Daily Data by County").unwrap().requires("bdate"));
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let err = GoalCatalog::from_json_str(r#"{"Bad": {"endpoint": " "}}"#).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_shipped_catalog_matches_builtin() {
        let shipped = GoalCatalog::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/search_goals.json")).unwrap();
        let builtin = GoalCatalog::aqs_default();
        assert_eq!(shipped.names().collect::<Vec<_>>(), builtin.names().collect::<Vec<_>>());
        for name in builtin.names() {
            assert_eq!(shipped.get(name).unwrap(), builtin.get(name).unwrap());
        }
    }
}
