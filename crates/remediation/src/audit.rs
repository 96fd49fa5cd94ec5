//! Append-only remediation audit trail with SHA-256 hash chaining.
//!
//! One record per attempted side effect (and per refusal). Each record
//! carries the hash of its predecessor, so editing or dropping a record
//! breaks [`AuditTrail::verify_chain`]. Records can also be mirrored to a
//! JSON-lines file for retention outside the process.

use autoheal_core::plan::{ActionStep, Parameters};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const GENESIS: &str = "genesis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Started,
    Success,
    Failed,
    Rejected,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
            AuditStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub plan_id: String,
    pub step_id: String,
    pub anomaly_id: String,
    /// Action type, suffixed with `_rollback` for compensations.
    pub action_type: String,
    pub target: String,
    pub namespace: String,
    pub status: AuditStatus,
    pub actor: String,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub state_before: Parameters,
    pub previous_hash: String,
    pub record_hash: String,
}

impl AuditRecord {
    fn content(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            self.sequence,
            self.plan_id,
            self.step_id,
            self.action_type,
            self.target,
            self.status.as_str(),
            self.timestamp.to_rfc3339(),
            self.previous_hash,
        )
    }
}

/// What the executor knows when it writes a record; sequencing and hashes
/// are filled in by the trail.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub plan_id: String,
    pub anomaly_id: String,
    pub step_id: String,
    pub action_type: String,
    pub target: String,
    pub namespace: String,
    pub status: AuditStatus,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub parameters: Parameters,
    pub state_before: Parameters,
}

impl AuditEntry {
    pub fn for_step(plan_id: &str, anomaly_id: &str, step: &ActionStep, status: AuditStatus) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            anomaly_id: anomaly_id.to_string(),
            step_id: step.id.clone(),
            action_type: step.action_type.as_str().to_string(),
            target: step.target.clone(),
            namespace: step.namespace.clone(),
            status,
            duration_seconds: None,
            error_message: None,
            parameters: step.parameters.clone(),
            state_before: Parameters::new(),
        }
    }

    pub fn rollback(mut self) -> Self {
        self.action_type = format!("{}_rollback", self.action_type);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_duration(mut self, seconds: Option<f64>) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn with_state_before(mut self, state_before: Parameters) -> Self {
        self.state_before = state_before;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_records: usize,
    pub valid_records: usize,
    pub tampered_sequences: Vec<u64>,
    pub chain_intact: bool,
}

struct ChainState {
    records: Vec<AuditRecord>,
    last_hash: String,
}

pub struct AuditTrail {
    chain: Mutex<ChainState>,
    log_file: Option<PathBuf>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(ChainState {
                records: Vec::new(),
                last_hash: GENESIS.to_string(),
            }),
            log_file: None,
        }
    }

    /// Also appends every record to `path` as one JSON object per line.
    pub fn with_log_file(path: impl Into<PathBuf>) -> Self {
        Self {
            log_file: Some(path.into()),
            ..Self::new()
        }
    }

    /// Chains and stores an entry, returning the sealed record.
    pub fn record(&self, entry: AuditEntry) -> AuditRecord {
        let sealed = {
            let mut chain = self.chain.lock();
            let mut record = AuditRecord {
                id: Uuid::new_v4(),
                sequence: chain.records.len() as u64 + 1,
                timestamp: Utc::now(),
                plan_id: entry.plan_id,
                step_id: entry.step_id,
                anomaly_id: entry.anomaly_id,
                action_type: entry.action_type,
                target: entry.target,
                namespace: entry.namespace,
                status: entry.status,
                actor: "system".to_string(),
                duration_seconds: entry.duration_seconds,
                error_message: entry.error_message,
                parameters: entry.parameters,
                state_before: entry.state_before,
                previous_hash: chain.last_hash.clone(),
                record_hash: String::new(),
            };
            record.record_hash = sha256_hex(&record.content());
            chain.last_hash = record.record_hash.clone();
            chain.records.push(record.clone());
            record
        };

        debug!(
            sequence = sealed.sequence,
            plan_id = %sealed.plan_id,
            action = %sealed.action_type,
            status = sealed.status.as_str(),
            "Audit record chained"
        );
        if let Some(path) = &self.log_file {
            if let Err(e) = append_json_line(path, &sealed) {
                warn!(path = %path.display(), error = %e, "Failed to append audit record");
            }
        }
        sealed
    }

    pub fn len(&self) -> usize {
        self.chain.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.lock().records.is_empty()
    }

    /// Records of one plan in chain order.
    pub fn by_plan(&self, plan_id: &str) -> Vec<AuditRecord> {
        self.filtered(|r| r.plan_id == plan_id)
    }

    pub fn by_anomaly(&self, anomaly_id: &str) -> Vec<AuditRecord> {
        self.filtered(|r| r.anomaly_id == anomaly_id)
    }

    pub fn by_target(&self, target: &str) -> Vec<AuditRecord> {
        self.filtered(|r| r.target == target)
    }

    /// Failed and rejected records, newest first.
    pub fn failures(&self, limit: usize) -> Vec<AuditRecord> {
        let mut out = self.filtered(|r| {
            matches!(r.status, AuditStatus::Failed | AuditStatus::Rejected)
        });
        out.reverse();
        out.truncate(limit);
        out
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let chain = self.chain.lock();
        chain.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn verify_chain(&self) -> ChainVerification {
        let chain = self.chain.lock();
        let total = chain.records.len();
        let mut valid = 0;
        let mut tampered = Vec::new();
        let mut expected_prev = GENESIS.to_string();

        for record in &chain.records {
            if record.previous_hash == expected_prev && sha256_hex(&record.content()) == record.record_hash {
                valid += 1;
            } else {
                tampered.push(record.sequence);
            }
            expected_prev = record.record_hash.clone();
        }

        ChainVerification {
            total_records: total,
            valid_records: valid,
            tampered_sequences: tampered,
            chain_intact: valid == total,
        }
    }

    fn filtered(&self, keep: impl Fn(&AuditRecord) -> bool) -> Vec<AuditRecord> {
        let chain = self.chain.lock();
        chain.records.iter().filter(|r| keep(r)).cloned().collect()
    }

    #[cfg(test)]
    fn tamper(&self, sequence: u64, edit: impl FnOnce(&mut AuditRecord)) {
        let mut chain = self.chain.lock();
        if let Some(record) = chain.records.iter_mut().find(|r| r.sequence == sequence) {
            edit(record);
        }
    }
}

fn append_json_line(path: &Path, record: &AuditRecord) -> std::io::Result<()> {
    let line = serde_json::to_string(record)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoheal_core::plan::ActionType;

    fn step(target: &str) -> ActionStep {
        ActionStep::new(ActionType::PodRestart, target, "production")
    }

    fn fill(trail: &AuditTrail) {
        let a = step("trading-api");
        let b = step("matching-engine");
        trail.record(AuditEntry::for_step("PLAN-1", "ANO-1", &a, AuditStatus::Started));
        trail.record(AuditEntry::for_step("PLAN-1", "ANO-1", &a, AuditStatus::Success));
        trail.record(
            AuditEntry::for_step("PLAN-2", "ANO-2", &b, AuditStatus::Failed).with_error("boom"),
        );
        trail.record(AuditEntry::for_step("PLAN-1", "ANO-1", &a, AuditStatus::Success).rollback());
    }

    #[test]
    fn test_chain_links_and_queries() {
        let trail = AuditTrail::new();
        fill(&trail);

        let records = trail.recent(10);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].sequence, 4);
        assert_eq!(records[0].action_type, "pod_restart_rollback");
        assert_eq!(records[3].previous_hash, "genesis");
        assert_eq!(records[2].previous_hash, records[3].record_hash);

        assert_eq!(trail.by_plan("PLAN-1").len(), 3);
        assert_eq!(trail.by_anomaly("ANO-2").len(), 1);
        assert_eq!(trail.by_target("matching-engine").len(), 1);
        let failures = trail.failures(10);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_message.as_deref(), Some("boom"));

        let verification = trail.verify_chain();
        assert!(verification.chain_intact);
        assert_eq!(verification.total_records, 4);
    }

    #[test]
    fn test_tampering_is_detected() {
        let trail = AuditTrail::new();
        fill(&trail);
        trail.tamper(2, |r| r.status = AuditStatus::Failed);

        let verification = trail.verify_chain();
        assert!(!verification.chain_intact);
        assert_eq!(verification.tampered_sequences, vec![2]);
        assert_eq!(verification.valid_records, 3);
    }

    #[test]
    fn test_json_lines_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let trail = AuditTrail::with_log_file(&path);
        fill(&trail);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 4);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.status, AuditStatus::Started);
    }
}
