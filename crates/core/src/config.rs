use serde::Deserialize;

use crate::error::{AutohealError, AutohealResult};
use crate::types::BreachDirection;

/// Root engine configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `AUTOHEAL__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// YAML file with RCA rules; the built-in rule set is used when unset.
    #[serde(default)]
    pub rules_file: Option<String>,
    /// Directory of YAML playbooks.
    #[serde(default)]
    pub playbooks_dir: Option<String>,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub rca: RcaConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaselineConfig {
    #[serde(default = "default_min_history_days")]
    pub min_history_days: u32,
    #[serde(default = "default_optimal_history_days")]
    pub optimal_history_days: u32,
    #[serde(default = "default_learning_interval_hours")]
    pub learning_interval_hours: u64,
    /// Seasonal decomposition period, in samples.
    #[serde(default = "default_seasonal_period")]
    pub seasonal_period: usize,
    /// Modified z-score above which a point is excluded from learning.
    #[serde(default = "default_outlier_sigma")]
    pub outlier_sigma: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_min_hourly_samples")]
    pub min_hourly_samples: usize,
    #[serde(default = "default_min_weekday_samples")]
    pub min_weekday_samples: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_forecast_min_points")]
    pub min_points: usize,
    #[serde(default = "default_max_seasonal_period")]
    pub max_seasonal_period: usize,
    /// Damped trend is only fitted above this many points.
    #[serde(default = "default_damping_min_points")]
    pub damping_min_points: usize,
    #[serde(default = "default_damping_phi")]
    pub damping_phi: f64,
    #[serde(default = "default_forecast_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_confidence_z")]
    pub confidence_z: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_zscore_threshold")]
    pub zscore_threshold: f64,
    #[serde(default = "default_mad_threshold")]
    pub mad_threshold: f64,
    #[serde(default = "default_ensemble_min_votes")]
    pub ensemble_min_votes: usize,
    /// Fraction of the z-score threshold below which an active anomaly resolves.
    #[serde(default = "default_resolve_ratio")]
    pub resolve_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RcaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rca_lookback_minutes")]
    pub lookback_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub weights: RiskWeights,
    #[serde(default)]
    pub thresholds: RiskThresholds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskWeights {
    #[serde(default = "default_weight_severity")]
    pub severity: f64,
    #[serde(default = "default_weight_urgency")]
    pub urgency: f64,
    #[serde(default = "default_weight_impact")]
    pub impact: f64,
    #[serde(default = "default_weight_complexity")]
    pub complexity: f64,
}

/// Ascending cut points separating auto / semi_auto / manual / critical.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskThresholds {
    #[serde(default = "default_threshold_auto")]
    pub auto: f64,
    #[serde(default = "default_threshold_semi_auto")]
    pub semi_auto: f64,
    #[serde(default = "default_threshold_manual")]
    pub manual: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_timeout_minutes")]
    pub timeout_minutes: i64,
    #[serde(default = "default_required_semi_auto")]
    pub required_semi_auto: u32,
    #[serde(default = "default_required_manual")]
    pub required_manual: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    /// Audit records are additionally appended here as JSON lines.
    #[serde(default)]
    pub audit_log_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default = "default_blacklist_namespaces")]
    pub namespaces: Vec<String>,
    /// `key=value` entries; the key is matched as a substring of the target.
    #[serde(default = "default_blacklist_labels")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_dedup_cooldown_seconds")]
    pub dedup_cooldown_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_detection_window_minutes")]
    pub detection_window_minutes: i64,
    #[serde(default = "default_error_backoff_seconds")]
    pub error_backoff_seconds: u64,
    #[serde(default = "default_prediction_horizons_hours")]
    pub prediction_horizons_hours: Vec<u32>,
    /// Metrics watched for proactive breach notifications.
    #[serde(default)]
    pub breach_thresholds: Vec<BreachThresholdConfig>,
    /// History fed to the forecaster for breach checks.
    #[serde(default = "default_forecast_lookback_hours")]
    pub forecast_lookback_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreachThresholdConfig {
    pub metric: String,
    pub threshold: f64,
    #[serde(default = "default_breach_direction")]
    pub direction: BreachDirection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "autoheal-01".to_string()
}
fn default_true() -> bool {
    true
}
fn default_min_history_days() -> u32 {
    7
}
fn default_optimal_history_days() -> u32 {
    30
}
fn default_learning_interval_hours() -> u64 {
    24
}
fn default_seasonal_period() -> usize {
    1440
}
fn default_outlier_sigma() -> f64 {
    4.0
}
fn default_min_samples() -> usize {
    24
}
fn default_min_hourly_samples() -> usize {
    5
}
fn default_min_weekday_samples() -> usize {
    3
}
fn default_forecast_min_points() -> usize {
    24
}
fn default_max_seasonal_period() -> usize {
    60
}
fn default_damping_min_points() -> usize {
    100
}
fn default_damping_phi() -> f64 {
    0.98
}
fn default_forecast_cache_ttl_secs() -> u64 {
    300
}
fn default_confidence_z() -> f64 {
    1.96
}
fn default_zscore_threshold() -> f64 {
    3.0
}
fn default_mad_threshold() -> f64 {
    3.5
}
fn default_ensemble_min_votes() -> usize {
    2
}
fn default_resolve_ratio() -> f64 {
    0.7
}
fn default_rca_lookback_minutes() -> i64 {
    30
}
fn default_weight_severity() -> f64 {
    0.35
}
fn default_weight_urgency() -> f64 {
    0.25
}
fn default_weight_impact() -> f64 {
    0.25
}
fn default_weight_complexity() -> f64 {
    0.15
}
fn default_threshold_auto() -> f64 {
    0.4
}
fn default_threshold_semi_auto() -> f64 {
    0.6
}
fn default_threshold_manual() -> f64 {
    0.8
}
fn default_approval_timeout_minutes() -> i64 {
    30
}
fn default_required_semi_auto() -> u32 {
    1
}
fn default_required_manual() -> u32 {
    2
}
fn default_max_concurrent_actions() -> usize {
    3
}
fn default_cooldown_minutes() -> i64 {
    5
}
fn default_step_timeout_seconds() -> u64 {
    300
}
fn default_blacklist_namespaces() -> Vec<String> {
    vec!["kube-system".to_string()]
}
fn default_blacklist_labels() -> Vec<String> {
    vec!["do-not-remediate=true".to_string()]
}
fn default_webhook_timeout_seconds() -> u64 {
    10
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_initial_backoff_ms() -> u64 {
    1000
}
fn default_retry_max_backoff_ms() -> u64 {
    10_000
}
fn default_dedup_cooldown_seconds() -> i64 {
    300
}
fn default_check_interval_seconds() -> u64 {
    60
}
fn default_detection_window_minutes() -> i64 {
    5
}
fn default_error_backoff_seconds() -> u64 {
    5
}
fn default_prediction_horizons_hours() -> Vec<u32> {
    vec![1]
}
fn default_forecast_lookback_hours() -> i64 {
    6
}
fn default_breach_direction() -> BreachDirection {
    BreachDirection::Above
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            min_history_days: default_min_history_days(),
            optimal_history_days: default_optimal_history_days(),
            learning_interval_hours: default_learning_interval_hours(),
            seasonal_period: default_seasonal_period(),
            outlier_sigma: default_outlier_sigma(),
            min_samples: default_min_samples(),
            min_hourly_samples: default_min_hourly_samples(),
            min_weekday_samples: default_min_weekday_samples(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_points: default_forecast_min_points(),
            max_seasonal_period: default_max_seasonal_period(),
            damping_min_points: default_damping_min_points(),
            damping_phi: default_damping_phi(),
            cache_ttl_secs: default_forecast_cache_ttl_secs(),
            confidence_z: default_confidence_z(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            zscore_threshold: default_zscore_threshold(),
            mad_threshold: default_mad_threshold(),
            ensemble_min_votes: default_ensemble_min_votes(),
            resolve_ratio: default_resolve_ratio(),
        }
    }
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_minutes: default_rca_lookback_minutes(),
        }
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            severity: default_weight_severity(),
            urgency: default_weight_urgency(),
            impact: default_weight_impact(),
            complexity: default_weight_complexity(),
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            auto: default_threshold_auto(),
            semi_auto: default_threshold_semi_auto(),
            manual: default_threshold_manual(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_approval_timeout_minutes(),
            required_semi_auto: default_required_semi_auto(),
            required_manual: default_required_manual(),
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            namespaces: default_blacklist_namespaces(),
            labels: default_blacklist_labels(),
        }
    }
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            max_concurrent_actions: default_max_concurrent_actions(),
            cooldown_minutes: default_cooldown_minutes(),
            step_timeout_seconds: default_step_timeout_seconds(),
            blacklist: BlacklistConfig::default(),
            audit_log_file: None,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            timeout_seconds: default_webhook_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            dedup_cooldown_seconds: default_dedup_cooldown_seconds(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval_seconds(),
            detection_window_minutes: default_detection_window_minutes(),
            error_backoff_seconds: default_error_backoff_seconds(),
            prediction_horizons_hours: default_prediction_horizons_hours(),
            breach_thresholds: Vec::new(),
            forecast_lookback_hours: default_forecast_lookback_hours(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            rules_file: None,
            playbooks_dir: None,
            baseline: BaselineConfig::default(),
            forecast: ForecastConfig::default(),
            detection: DetectionConfig::default(),
            rca: RcaConfig::default(),
            risk: RiskConfig::default(),
            approval: ApprovalConfig::default(),
            remediation: RemediationConfig::default(),
            notification: NotificationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load from an optional TOML file, overlaid by `AUTOHEAL__*` variables.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(std::path::Path::new(path))
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("AUTOHEAL")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject configurations the risk model cannot interpret.
    pub fn validate(&self) -> AutohealResult<()> {
        let w = &self.risk.weights;
        let sum = w.severity + w.urgency + w.impact + w.complexity;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(AutohealError::Config(format!(
                "risk weights must sum to 1.0, got {sum:.3}"
            )));
        }
        let t = &self.risk.thresholds;
        if !(t.auto < t.semi_auto && t.semi_auto < t.manual) {
            return Err(AutohealError::Config(
                "risk thresholds must be strictly ascending (auto < semi_auto < manual)".into(),
            ));
        }
        if self.remediation.max_concurrent_actions == 0 {
            return Err(AutohealError::Config(
                "remediation.max_concurrent_actions must be at least 1".into(),
            ));
        }
        if self.baseline.min_history_days == 0 || self.baseline.optimal_history_days == 0 {
            return Err(AutohealError::Config(
                "baseline history days must be positive".into(),
            ));
        }
        Ok(())
    }
}
