//! Configuração do benchgrid carregada a partir de `benchgrid.toml`.
//!
//! A struct [`BenchConfig`] contém o repositório compartilhado, a matriz de
//! fases, as políticas por host e o despachante de execuções.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `BENCHGRID_HOST` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BenchError, Result};
use crate::layout::Layout;
use crate::matrix::PhaseDefinition;
use crate::policy::PolicyBook;
use crate::sync::RetryConfig;

/// Nome padrão do arquivo de configuração.
pub const CONFIG_FILE: &str = "benchgrid.toml";

/// Variável de ambiente que sobrescreve o nome do host.
pub const HOST_ENV: &str = "BENCHGRID_HOST";

/// Configuração de nível superior carregada de `benchgrid.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    /// Caminho da cópia local do repositório compartilhado.
    #[serde(default = "default_store")]
    pub store: PathBuf,

    /// Remoto git usado para sincronizar. Vazio significa modo apenas local.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch compartilhado por todos os hosts.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Nome do host fixado no arquivo, se houver.
    #[serde(default)]
    pub host: Option<String>,

    /// Retentativas de sincronização e publicação.
    #[serde(default)]
    pub sync: RetryConfig,

    /// Diretórios dentro do repositório compartilhado.
    #[serde(default)]
    pub layout: Layout,

    /// Comando externo que executa cada item.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Definições de fase, na ordem declarada.
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,

    /// Políticas por host e a política padrão.
    #[serde(default)]
    pub policy: PolicyBook,
}

/// Configuração do despachante de execuções.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatcherConfig {
    /// Programa e argumentos fixos; os argumentos do item são acrescentados.
    #[serde(default)]
    pub command: Vec<String>,

    /// Tempo máximo por execução em segundos. Zero desativa o limite.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Diretório de trabalho do comando.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

// Valor padrão para o repositório local: "results".
fn default_store() -> PathBuf {
    PathBuf::from("results")
}

// Valor padrão para o remoto: "origin".
fn default_remote() -> String {
    "origin".to_string()
}

// Valor padrão para o branch: "main".
fn default_branch() -> String {
    "main".to_string()
}

// Valor padrão para o limite de execução: uma hora.
fn default_timeout_secs() -> u64 {
    3600
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_timeout_secs(),
            working_dir: None,
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            remote: default_remote(),
            branch: default_branch(),
            host: None,
            sync: RetryConfig::default(),
            layout: Layout::default(),
            dispatcher: DispatcherConfig::default(),
            phases: Vec::new(),
            policy: PolicyBook::default(),
        }
    }
}

impl BenchConfig {
    /// Carrega a configuração do caminho indicado.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o host.
        config.apply_host_env(std::env::var(HOST_ENV).ok());
        Ok(config)
    }

    /// Interpreta o conteúdo TOML e valida as fases.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: BenchConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_host_env(&mut self, value: Option<String>) {
        if let Some(host) = value
            && !host.trim().is_empty()
        {
            self.host = Some(host);
        }
    }

    // Nomes de fase repetidos tornariam os manifestos ambíguos.
    fn validate(&self) -> Result<()> {
        for (i, phase) in self.phases.iter().enumerate() {
            if self.phases[..i].iter().any(|p| p.name == phase.name) {
                return Err(BenchError::ManifestCorruption {
                    phase: phase.name.clone(),
                    reason: "phase defined more than once in configuration".into(),
                });
            }
        }
        Ok(())
    }

    /// Remoto efetivo; `None` em modo apenas local.
    pub fn remote_name(&self) -> Option<String> {
        let remote = self.remote.trim();
        (!remote.is_empty()).then(|| remote.to_string())
    }

    /// Busca uma fase pelo nome.
    pub fn phase(&self, name: &str) -> Result<&PhaseDefinition> {
        self.phases
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| BenchError::UnknownPhase(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BenchConfig::default();
        assert_eq!(config.store, PathBuf::from("results"));
        assert_eq!(config.remote_name().as_deref(), Some("origin"));
        assert_eq!(config.branch, "main");
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.dispatcher.timeout_secs, 3600);
        assert!(config.phases.is_empty());
        assert!(config.host.is_none());
    }

    #[test]
    fn deserialize_full_toml() {
        let toml_str = r#"
            store = "/data/bench"
            remote = ""
            host = "gpu-1"

            [sync]
            max_retries = 8

            [layout]
            results_dir = "out"
            claims_dir = "out/claims"

            [dispatcher]
            command = ["python", "-m", "bench.run"]
            timeout_secs = 0

            [[phases]]
            name = "p1"
            configurations = ["base"]
            levels = ["salad", "onion"]
            pairings = ["qwen3-8b", "qwen3-8b+mistral-24b"]
            reruns = 3

            [policy.default]
            pairings = ["qwen3-8b"]
            phases = ["p1"]

            [policy.hosts.gpu-1]
            pairings = ["qwen3-8b+mistral-24b"]
        "#;
        let config = BenchConfig::parse(toml_str).unwrap();
        assert_eq!(config.store, PathBuf::from("/data/bench"));
        assert_eq!(config.remote_name(), None);
        assert_eq!(config.host.as_deref(), Some("gpu-1"));
        assert_eq!(config.sync.max_retries, 8);
        assert_eq!(config.sync.base_delay_ms, 500);
        assert_eq!(config.layout.results_dir, "out");
        assert_eq!(config.layout.phase_dir, "phase");
        assert_eq!(config.dispatcher.command.len(), 3);
        assert_eq!(config.dispatcher.timeout_secs, 0);
        assert_eq!(config.phase("p1").unwrap().reruns, 3);
        assert!(config.policy.hosts.contains_key("gpu-1"));
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let config = BenchConfig::default();
        assert!(matches!(config.phase("p9"), Err(BenchError::UnknownPhase(_))));
    }

    #[test]
    fn duplicate_phase_names_are_rejected() {
        let toml_str = r#"
            [[phases]]
            name = "p1"
            configurations = ["c"]
            levels = ["l"]
            pairings = ["m"]

            [[phases]]
            name = "p1"
            configurations = ["c"]
            levels = ["l"]
            pairings = ["m"]
        "#;
        assert!(BenchConfig::parse(toml_str).is_err());
    }

    #[test]
    fn host_env_overrides_file() {
        let mut config = BenchConfig::parse("host = \"from-file\"").unwrap();
        config.apply_host_env(Some("   ".into()));
        assert_eq!(config.host.as_deref(), Some("from-file"));
        config.apply_host_env(Some("from-env".into()));
        assert_eq!(config.host.as_deref(), Some("from-env"));
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BenchConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.branch, "main");
    }
}
