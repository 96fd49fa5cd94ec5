//! Declarative remediation playbooks loaded from a directory of YAML files.

use autoheal_core::plan::{ActionType, Parameters};
use autoheal_core::{AutohealError, AutohealResult};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookStep {
    pub name: String,
    pub action: ActionType,
    pub target: String,
    /// Falls back to the anomaly's namespace when unset.
    pub namespace: Option<String>,
    pub parameters: Parameters,
    pub timeout_seconds: u64,
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger_conditions: Vec<String>,
    pub steps: Vec<PlaybookStep>,
    pub tags: Vec<String>,
    /// Author-assessed risk score used instead of the computed one.
    pub risk_override: Option<f64>,
    pub enabled: bool,
}

impl Playbook {
    /// Parses one playbook document. `fallback_id` names it when the
    /// document has no `id`. Steps with unknown actions are dropped.
    pub fn from_yaml_str(raw: &str, fallback_id: &str) -> AutohealResult<Self> {
        let doc: PlaybookDoc = serde_yaml::from_str(raw)?;
        let id = doc.id.unwrap_or_else(|| fallback_id.to_string());
        let steps = doc
            .steps
            .into_iter()
            .filter_map(|s| match s.action.parse::<ActionType>() {
                Ok(action) => Some(PlaybookStep {
                    name: if s.name.is_empty() { action.to_string() } else { s.name },
                    action,
                    target: s.target,
                    namespace: s.namespace,
                    parameters: s.parameters,
                    timeout_seconds: s.timeout_seconds,
                    rollback_on_failure: s.rollback_on_failure,
                }),
                Err(_) => {
                    warn!(playbook = %id, action = %s.action, "Unknown action type in playbook step");
                    None
                }
            })
            .collect();

        Ok(Self {
            name: doc.name.unwrap_or_else(|| id.clone()),
            id,
            description: doc.description,
            trigger_conditions: doc.trigger_conditions,
            steps,
            tags: doc.tags,
            risk_override: doc.risk_override,
            enabled: doc.enabled,
        })
    }

    /// A trigger condition mentions the metric or anomaly type, or a tag is shared.
    pub fn matches(&self, metric_name: &str, anomaly_type: Option<&str>, tags: &[String]) -> bool {
        if !self.enabled {
            return false;
        }
        let condition_match = self.trigger_conditions.iter().any(|c| {
            c.contains(metric_name) || anomaly_type.is_some_and(|t| c.contains(t))
        });
        let tag_match = tags.iter().any(|t| self.tags.contains(t));
        condition_match || tag_match
    }
}

#[derive(Debug, Deserialize)]
struct PlaybookDoc {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    trigger_conditions: Vec<String>,
    #[serde(default)]
    steps: Vec<StepDoc>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    risk_override: Option<f64>,
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct StepDoc {
    #[serde(default)]
    name: String,
    action: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default = "default_step_timeout")]
    timeout_seconds: u64,
    #[serde(default = "default_true")]
    rollback_on_failure: bool,
}

fn default_true() -> bool {
    true
}
fn default_step_timeout() -> u64 {
    300
}

/// Playbooks by id. Reloadable from the directory it was built from.
#[derive(Debug, Default)]
pub struct PlaybookLibrary {
    dir: Option<PathBuf>,
    playbooks: RwLock<BTreeMap<String, Playbook>>,
}

impl PlaybookLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_playbooks(playbooks: Vec<Playbook>) -> Self {
        let library = Self::new();
        for playbook in playbooks {
            library.insert(playbook);
        }
        library
    }

    /// Loads every `*.yaml` / `*.yml` in `dir`. Files that fail to parse are
    /// skipped; a missing directory yields an empty library.
    pub fn load_dir(dir: impl AsRef<Path>) -> AutohealResult<Self> {
        let library = Self {
            dir: Some(dir.as_ref().to_path_buf()),
            playbooks: RwLock::new(BTreeMap::new()),
        };
        library.reload()?;
        Ok(library)
    }

    /// Re-reads the source directory, replacing the loaded set.
    pub fn reload(&self) -> AutohealResult<usize> {
        let Some(dir) = &self.dir else {
            return Ok(self.len());
        };
        if !dir.exists() {
            warn!(path = %dir.display(), "Playbooks directory not found");
            self.playbooks.write().clear();
            return Ok(0);
        }

        let mut loaded = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            match load_file(&path) {
                Ok(playbook) => {
                    loaded.insert(playbook.id.clone(), playbook);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to load playbook"),
            }
        }

        let count = loaded.len();
        *self.playbooks.write() = loaded;
        info!(path = %dir.display(), count = count, "Playbooks loaded");
        Ok(count)
    }

    pub fn insert(&self, playbook: Playbook) {
        self.playbooks.write().insert(playbook.id.clone(), playbook);
    }

    pub fn get(&self, id: &str) -> Option<Playbook> {
        self.playbooks.read().get(id).cloned()
    }

    /// All playbooks, ordered by id.
    pub fn list(&self) -> Vec<Playbook> {
        self.playbooks.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.playbooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.playbooks.read().is_empty()
    }

    /// Enabled playbooks applicable to the anomaly, ordered by id.
    pub fn find_matching(
        &self,
        metric_name: &str,
        anomaly_type: Option<&str>,
        tags: &[String],
    ) -> Vec<Playbook> {
        self.playbooks
            .read()
            .values()
            .filter(|p| p.matches(metric_name, anomaly_type, tags))
            .cloned()
            .collect()
    }
}

fn load_file(path: &Path) -> AutohealResult<Playbook> {
    let raw = std::fs::read_to_string(path)?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| AutohealError::Config(format!("bad playbook file name: {}", path.display())))?;
    Playbook::from_yaml_str(&raw, stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LATENCY: &str = r#"
id: pb-latency
name: High latency
trigger_conditions:
  - "order_latency_ms > 200"
steps:
  - name: Scale out
    action: hpa_scale
    target: trading-api
    parameters:
      replicas: 6
  - action: teleport
    target: trading-api
  - name: Restart
    action: pod_restart
    target: trading-api
    namespace: trading
    timeout_seconds: 60
    rollback_on_failure: false
tags: [latency, trading]
"#;

    const DISABLED: &str = r#"
id: pb-disabled
trigger_conditions: ["order_latency_ms"]
steps:
  - action: pod_restart
    target: x
enabled: false
"#;

    #[test]
    fn test_parse_defaults_and_unknown_action() {
        let pb = Playbook::from_yaml_str(LATENCY, "fallback").unwrap();
        assert_eq!(pb.id, "pb-latency");
        assert_eq!(pb.steps.len(), 2);
        assert_eq!(pb.steps[0].action, ActionType::HpaScale);
        assert_eq!(pb.steps[0].timeout_seconds, 300);
        assert!(pb.steps[0].rollback_on_failure);
        assert_eq!(pb.steps[0].parameters["replicas"], 6);
        assert_eq!(pb.steps[1].namespace.as_deref(), Some("trading"));
        assert!(!pb.steps[1].rollback_on_failure);
        assert!(pb.enabled);
    }

    #[test]
    fn test_matching_rules() {
        let library = PlaybookLibrary::from_playbooks(vec![
            Playbook::from_yaml_str(LATENCY, "a").unwrap(),
            Playbook::from_yaml_str(DISABLED, "b").unwrap(),
        ]);
        let by_metric = library.find_matching("order_latency_ms", None, &[]);
        assert_eq!(by_metric.len(), 1);
        assert_eq!(by_metric[0].id, "pb-latency");

        let by_tag = library.find_matching("cpu", None, &["latency".to_string()]);
        assert_eq!(by_tag.len(), 1);
        // no condition, no shared tag
        assert!(library.find_matching("cpu", Some("trend"), &[]).is_empty());
    }

    #[test]
    fn test_load_dir_skips_bad_files_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("latency.yaml"), LATENCY).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "steps: [: :").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(
            dir.path().join("no_id.yml"),
            "steps:\n  - action: cache_flush\n    target: redis\n",
        )
        .unwrap();

        let library = PlaybookLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 2);
        assert!(library.get("no_id").is_some());
        assert_eq!(
            library.list().iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["no_id", "pb-latency"]
        );

        std::fs::remove_file(dir.path().join("no_id.yml")).unwrap();
        assert_eq!(library.reload().unwrap(), 1);
        assert!(library.get("no_id").is_none());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let library = PlaybookLibrary::load_dir("/nonexistent/playbooks").unwrap();
        assert!(library.is_empty());
    }
}
