//! Configuração do corretor carregada a partir de `corrector.toml`.
//!
//! A struct [`CorrectorConfig`] contém todos os parâmetros configuráveis:
//! cadeia de tiers, retentativas, lanes do scheduler, backlog, manutenção e
//! listas do validador. Valores ausentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::anthropic::client::API_URL;
use crate::error::CorrectorError;
use crate::escalation::{RetryConfig, TierConfig, default_tiers};
use crate::state_machine::CorrectionType;
use crate::validator::{DEFAULT_ALLOW_LIST, DEFAULT_DENY_LIST, Validator};

/// Nome do arquivo procurado no diretório atual quando `--config` não é dado.
pub const DEFAULT_CONFIG_FILE: &str = "corrector.toml";

/// Configuração de nível superior carregada de `corrector.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    /// Chave da API Anthropic.
    pub api_key: String,

    /// Endpoint da Messages API (sobrescrito em testes).
    pub api_url: String,

    /// Snapshot JSON do store de work items.
    pub state_path: PathBuf,

    /// Catálogo JSON de subjects corrigíveis.
    pub subjects_path: PathBuf,

    /// Custo estimado por item, usado em lotes e métricas.
    pub per_item_cost: f64,

    pub retry: RetryConfig,

    /// Tiers em ordem crescente de custo.
    pub tiers: Vec<TierConfig>,

    pub lanes: Vec<LaneConfig>,

    pub backlog: BacklogConfig,

    pub maintenance: MaintenanceConfig,

    pub validator: ValidatorConfig,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: API_URL.to_string(),
            state_path: PathBuf::from("corrector-state.json"),
            subjects_path: PathBuf::from("subjects.json"),
            per_item_cost: 0.02,
            retry: RetryConfig::default(),
            tiers: default_tiers(),
            lanes: default_lanes(),
            backlog: BacklogConfig::default(),
            maintenance: MaintenanceConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

/// O que uma lane faz a cada tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneMode {
    /// Reivindica e processa itens.
    #[default]
    Mutating,
    /// Apenas registra contagens; nunca altera o store.
    Stats,
}

/// Uma cadência periódica nomeada para um tipo de correção.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaneConfig {
    pub name: String,
    pub correction_type: CorrectionType,
    #[serde(default)]
    pub mode: LaneMode,
    #[serde(default = "default_lane_interval_secs")]
    pub interval_secs: u64,
    /// Orçamento de um tick; também é o tempo de vida do lease.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_claim_limit")]
    pub claim_limit: usize,
}

fn default_lane_interval_secs() -> u64 {
    60
}

// Cobre uma cadeia completa no pior caso (tier premium com retentativas).
fn default_lease_timeout_secs() -> u64 {
    15 * 60
}

fn default_claim_limit() -> usize {
    1
}

impl LaneConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

// Uma lane rápida de escrita por tipo, mais uma lane de estatísticas.
fn default_lanes() -> Vec<LaneConfig> {
    let mut lanes: Vec<LaneConfig> = CorrectionType::ALL
        .iter()
        .map(|&t| LaneConfig {
            name: format!("{t}-fast"),
            correction_type: t,
            mode: LaneMode::Mutating,
            interval_secs: default_lane_interval_secs(),
            lease_timeout_secs: default_lease_timeout_secs(),
            claim_limit: default_claim_limit(),
        })
        .collect();
    lanes.push(LaneConfig {
        name: "pricing-stats".to_string(),
        correction_type: CorrectionType::Pricing,
        mode: LaneMode::Stats,
        interval_secs: 15 * 60,
        lease_timeout_secs: 60,
        claim_limit: 0,
    });
    lanes
}

/// Parâmetros do controlador de backlog.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    /// Não enfileira quando já há este número de itens Pending do tipo.
    pub pending_ceiling: usize,
    /// Máximo de itens criados por passada.
    pub batch_limit: usize,
    pub interval_secs: u64,
    /// Intervalo de recheck por tipo, em dias. Tipos ausentes usam o default do tipo.
    pub cooldown_days: BTreeMap<CorrectionType, i64>,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            pending_ceiling: 50,
            batch_limit: 20,
            interval_secs: 30 * 60,
            cooldown_days: BTreeMap::new(),
        }
    }
}

impl BacklogConfig {
    pub fn cooldown(&self, correction_type: CorrectionType) -> chrono::Duration {
        let days = self
            .cooldown_days
            .get(&correction_type)
            .copied()
            .unwrap_or_else(|| correction_type.default_cooldown_days());
        chrono::Duration::days(days)
    }
}

/// Parâmetros das tarefas de manutenção.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Itens em Processing há mais tempo que isso voltam para Pending.
    pub stuck_after_secs: u64,
    /// Itens Failed mais antigos que isso são apagados.
    pub failed_retention_secs: u64,
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stuck_after_secs: 4 * 3600,
            failed_retention_secs: 48 * 3600,
            interval_secs: 15 * 60,
        }
    }
}

impl MaintenanceConfig {
    pub fn stuck_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_after_secs as i64)
    }

    pub fn failed_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failed_retention_secs as i64)
    }
}

/// Listas de termos genéricos do validador.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub deny_list: Vec<String>,
    pub allow_list: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            deny_list: DEFAULT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            allow_list: DEFAULT_ALLOW_LIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ValidatorConfig {
    pub fn build(&self) -> Validator {
        Validator::new(self.deny_list.clone(), self.allow_list.clone())
    }
}

impl CorrectorConfig {
    /// Carrega a configuração de `path`, ou de `corrector.toml` no diretório
    /// atual. Usa valores padrão se o arquivo padrão não existir; um caminho
    /// explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self, CorrectorError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.api_key = key;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, CorrectorError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CorrectorError::Config(format!("reading {}: {e}", path.display()))
        })?;
        Ok(toml::from_str::<CorrectorConfig>(&contents)?)
    }

    /// Rejeita configurações que o executor ou o scheduler não conseguem usar.
    pub fn validate(&self) -> Result<(), CorrectorError> {
        let invalid = |msg: String| Err(CorrectorError::Config(msg));
        if self.tiers.is_empty() {
            return invalid("at least one tier must be configured".into());
        }
        for pair in self.tiers.windows(2) {
            if pair[1].cost_level <= pair[0].cost_level {
                return invalid(format!(
                    "tiers must be ordered by strictly ascending cost: {} ({}) comes after {} ({})",
                    pair[1].name, pair[1].cost_level, pair[0].name, pair[0].cost_level
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        let mut names = std::collections::HashSet::new();
        for lane in &self.lanes {
            if !names.insert(lane.name.as_str()) {
                return invalid(format!("duplicate lane name: {}", lane.name));
            }
            if lane.interval_secs == 0 || lane.lease_timeout_secs == 0 {
                return invalid(format!(
                    "lane {} needs a non-zero interval and lease timeout",
                    lane.name
                ));
            }
        }
        if self.backlog.interval_secs == 0 {
            return invalid("backlog.interval_secs must be non-zero".into());
        }
        if self.maintenance.interval_secs == 0 {
            return invalid("maintenance.interval_secs must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::prompt::Strictness;

    #[test]
    fn default_config_values() {
        let config = CorrectorConfig::default();
        assert!(config.api_key.is_empty());
        assert_eq!(config.api_url, API_URL);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.tiers.len(), 3);
        assert_eq!(config.maintenance.stuck_after(), chrono::Duration::hours(4));
        assert_eq!(config.maintenance.failed_retention(), chrono::Duration::hours(48));
        assert_eq!(config.lanes.len(), CorrectionType::ALL.len() + 1);
        config.validate().unwrap();
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"
            per_item_cost = 0.05

            [retry]
            max_attempts = 5
            base_delay_ms = 200

            [[tiers]]
            name = "cheap"
            model = "claude-haiku-4-5-20251001"
            cost_level = 1
            max_tokens = 1024
            temperature = 0.5
            timeout_secs = 30

            [[tiers]]
            name = "best"
            model = "claude-opus-4-6"
            cost_level = 10
            max_tokens = 8192
            temperature = 0.0
            timeout_secs = 300
            strictness = "strictest"

            [[lanes]]
            name = "specs-fast"
            correction_type = "specs"
            interval_secs = 30

            [backlog.cooldown_days]
            pricing = 7
        "#;
        let config: CorrectorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.tiers[1].strictness, Strictness::Strictest);
        assert_eq!(config.tiers[0].escalate_on.len(), 3);
        assert_eq!(config.lanes.len(), 1);
        assert_eq!(config.lanes[0].claim_limit, 1);
        assert_eq!(config.lanes[0].mode, LaneMode::Mutating);
        assert_eq!(config.backlog.cooldown(CorrectionType::Pricing), chrono::Duration::days(7));
        assert_eq!(config.backlog.cooldown(CorrectionType::Title), chrono::Duration::days(60));
        assert_eq!(config.backlog.pending_ceiling, 50);
        assert_eq!(config.validator.deny_list.len(), DEFAULT_DENY_LIST.len());
        config.validate().unwrap();
    }

    #[test]
    fn tiers_out_of_cost_order_are_rejected() {
        let mut config = CorrectorConfig::default();
        config.tiers.reverse();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ascending cost"));
    }

    #[test]
    fn tiers_with_equal_cost_are_rejected() {
        let mut config = CorrectorConfig::default();
        config.tiers[1].cost_level = config.tiers[0].cost_level;
        assert!(matches!(config.validate(), Err(CorrectorError::Config(_))));
    }

    #[test]
    fn zero_cadence_intervals_are_rejected() {
        let mut config = CorrectorConfig::default();
        config.backlog.interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backlog.interval_secs"));

        let mut config = CorrectorConfig::default();
        config.maintenance.interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("maintenance.interval_secs"));
    }

    #[test]
    fn duplicate_lane_names_are_rejected() {
        let mut config = CorrectorConfig::default();
        let first = config.lanes[0].clone();
        config.lanes.push(first);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "state_path = \"/tmp/state.json\"").unwrap();
        let config = CorrectorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.state_path, PathBuf::from("/tmp/state.json"));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let err = CorrectorConfig::load(Some(Path::new("/nonexistent/corrector.toml"))).unwrap_err();
        assert!(matches!(err, CorrectorError::Config(_)));
        assert!(err.to_string().contains("/nonexistent/corrector.toml"));
    }
}
