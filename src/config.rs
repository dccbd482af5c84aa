//! Configuração do inkflow carregada a partir de `inkflow.toml`.
//!
//! A struct [`InkflowConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

use crate::job::{MAX_ITEMS_PER_JOB, RetryPolicy};
use crate::pipeline::PricingTable;

/// Configuração de nível superior carregada de `inkflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct InkflowConfig {
    /// Chave da API Anthropic. Vazia ativa o executor simulado.
    #[serde(default)]
    pub api_key: String,

    /// Tamanho do pool de workers (global, não por job).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Limite de itens em execução simultânea por organização.
    #[serde(default)]
    pub per_org_concurrency: Option<usize>,

    /// Sobrescreve o limite acima para organizações específicas.
    #[serde(default)]
    pub org_concurrency: HashMap<String, usize>,

    #[serde(default = "default_max_items_per_job")]
    pub max_items_per_job: usize,

    /// Tentativas máximas por estágio, incluindo a primeira.
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_stage: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso entre tentativas.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout rígido de cada chamada de estágio.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Emite logs em JSON em vez de texto.
    #[serde(default)]
    pub log_json: bool,

    /// Orçamento em USD por organização; ausente significa ilimitado.
    #[serde(default)]
    pub budgets: HashMap<String, f64>,

    #[serde(default)]
    pub pricing: PricingTable,
}

fn default_max_workers() -> usize {
    4
}

fn default_max_items_per_job() -> usize {
    MAX_ITEMS_PER_JOB
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_stage_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for InkflowConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_workers: default_max_workers(),
            per_org_concurrency: None,
            org_concurrency: HashMap::new(),
            max_items_per_job: default_max_items_per_job(),
            max_attempts_per_stage: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            log_json: false,
            budgets: HashMap::new(),
            pricing: PricingTable::default(),
        }
    }
}

impl InkflowConfig {
    /// Carrega a configuração de `inkflow.toml` no diretório atual ou do
    /// caminho informado. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("inkflow.toml"));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<InkflowConfig>(&contents)
                .with_context(|| format!("invalid config in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita valores que quebrariam as regras da fila: lotes fora de
    /// 1..=50 itens ou uma organização com limite zero, que nunca andaria.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_ITEMS_PER_JOB).contains(&self.max_items_per_job),
            "max_items_per_job must be between 1 and {MAX_ITEMS_PER_JOB}, got {}",
            self.max_items_per_job
        );
        ensure!(
            self.per_org_concurrency != Some(0),
            "per_org_concurrency must be at least 1"
        );
        if let Some((org, _)) = self.org_concurrency.iter().find(|(_, cap)| **cap == 0) {
            bail!("org_concurrency for {org} must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts_per_stage.max(1),
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = InkflowConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_items_per_job, 50);
        assert_eq!(config.max_attempts_per_stage, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert!(config.per_org_concurrency.is_none());
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"
            max_workers = 8
            per_org_concurrency = 2

            [org_concurrency]
            acme = 5

            [budgets]
            acme = 12.5

            [pricing.opus]
            input_per_1k = 0.015
            output_per_1k = 0.075
        "#;
        let config: InkflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.per_org_concurrency, Some(2));
        assert_eq!(config.org_concurrency["acme"], 5);
        assert_eq!(config.budgets["acme"], 12.5);
        assert_eq!(config.pricing.opus.output_per_1k, 0.075);
        assert_eq!(config.pricing.haiku, PricingTable::default().haiku);
        assert_eq!(config.stage_timeout_secs, 120);
    }

    #[test]
    fn retry_policy_never_allows_zero_attempts() {
        let config = InkflowConfig {
            max_attempts_per_stage: 0,
            ..Default::default()
        };
        assert_eq!(config.retry_policy().max_attempts, 1);
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "max_workers = 2\nlog_json = true\n").unwrap();
        let config = InkflowConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_workers, 2);
        assert!(config.log_json);
    }

    #[test]
    fn load_rejects_items_cap_outside_job_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inkflow.toml");
        for value in [0, 51, 100] {
            std::fs::write(&path, format!("max_items_per_job = {value}\n")).unwrap();
            let err = InkflowConfig::load(Some(&path)).unwrap_err();
            assert!(err.to_string().contains("max_items_per_job"), "{err}");
        }
        std::fs::write(&path, "max_items_per_job = 10\n").unwrap();
        assert_eq!(InkflowConfig::load(Some(&path)).unwrap().max_items_per_job, 10);
    }

    #[test]
    fn load_rejects_zero_org_caps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inkflow.toml");

        std::fs::write(&path, "per_org_concurrency = 0\n").unwrap();
        let err = InkflowConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("per_org_concurrency"), "{err}");

        std::fs::write(&path, "per_org_concurrency = 2\n[org_concurrency]\nacme = 0\n").unwrap();
        let err = InkflowConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("acme"), "{err}");
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = InkflowConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.max_attempts_per_stage, 3);
    }
}
