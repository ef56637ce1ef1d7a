//! Configuração do logger via TOML.
//!
//! Um único `config.toml` com as seções `[logger]`, `[retry]` e `[display]`.
//! Campos ausentes usam o valor padrão.

use crate::session::RetryPolicy;
use crate::transport::DEFAULT_BAUD_RATE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Erro ao salvar a configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro ao gravar {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Portas e arquivos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Diretório dos arquivos `channel_*.dat`
    pub directory: PathBuf,
    /// Uma porta por monitor
    pub serial_ports: Vec<String>,
    pub baud_rate: u32,
    /// Relativo a `directory` quando não for absoluto
    pub mapping_file: PathBuf,
    /// Relativo a `directory` quando não for absoluto
    pub labels_file: PathBuf,
    /// Acrescenta porta e canal local em cada linha gravada
    pub write_provenance: bool,
    /// Nível de log quando `RUST_LOG` não está definido
    pub log_level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            serial_ports: vec!["/dev/ttyUSB0".into()],
            baud_rate: DEFAULT_BAUD_RATE,
            mapping_file: PathBuf::from("radioIDs.dat"),
            labels_file: PathBuf::from("labels.dat"),
            write_provenance: true,
            log_level: "info".into(),
        }
    }
}

/// Política de recuperação da serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_secs: f64,
    /// Timeout de cada leitura; só controla a frequência de checagem do cancelamento
    pub read_timeout_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_secs: 1.0,
            read_timeout_secs: 1.0,
        }
    }
}

/// Tela de status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Intervalo de redesenho no modo interativo
    pub refresh_secs: f64,
    /// Arquivo de status do modo headless (relativo a `directory`)
    pub stats_file: PathBuf,
    pub stats_interval_secs: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_secs: 1.0,
            stats_file: PathBuf::from("stats.dat"),
            stats_interval_secs: 60.0,
        }
    }
}

/// Configuração raiz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logger: LoggerConfig,
    pub retry: RetryConfig,
    pub display: DisplayConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.logger.serial_ports.is_empty() {
            errors.push("Nenhuma porta serial configurada".into());
        }
        if self.logger.serial_ports.iter().any(|p| p.trim().is_empty()) {
            errors.push("Porta serial vazia na lista".into());
        }
        let mut ports = self.logger.serial_ports.clone();
        ports.sort();
        ports.dedup();
        if ports.len() != self.logger.serial_ports.len() {
            errors.push("Porta serial repetida na lista".into());
        }
        if self.logger.baud_rate == 0 {
            errors.push("Baud rate não pode ser 0".into());
        }
        if self.retry.max_retries == 0 {
            errors.push("max_retries deve ser pelo menos 1".into());
        }
        for (name, secs, min) in [
            ("backoff_secs", self.retry.backoff_secs, 0.0),
            ("read_timeout_secs", self.retry.read_timeout_secs, f64::MIN_POSITIVE),
            ("refresh_secs", self.display.refresh_secs, f64::MIN_POSITIVE),
            ("stats_interval_secs", self.display.stats_interval_secs, f64::MIN_POSITIVE),
        ] {
            if !(secs >= min && secs <= 3600.0) {
                errors.push(format!("{name} inválido: {secs}"));
            }
        }

        errors
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            backoff: seconds(self.retry.backoff_secs),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        seconds(self.retry.read_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        seconds(self.display.refresh_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        seconds(self.display.stats_interval_secs)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.logger.directory.join(&self.logger.mapping_file)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.logger.directory.join(&self.logger.labels_file)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.logger.directory.join(&self.display.stats_file)
    }
}

/// Valores fora da faixa viram zero; `validate()` já os reporta.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}
