//! # IAM Logger
//!
//! Registra as leituras de potência de um ou mais monitores CurrentCost
//! ligados em portas seriais. Cada sensor ganha um arquivo
//! `channel_<canal>.dat` com linhas `<unix> <watts> [<porta> <canal local>]`.
//!
//! ## Uso
//! ```bash
//! iam_logger                        # Tabela de status no terminal
//! iam_logger --no-display           # Headless: grava stats.dat periodicamente
//! iam_logger --print-xml            # Só imprime o XML bruto de cada porta
//! iam_logger --config /etc/iam.toml
//! ```
//!
//! Ctrl+C (ou SIGTERM) encerra as sessões de forma ordenada.

mod status;

use clap::Parser;
use iam_core::config::AppConfig;
use iam_core::labels::{LabelIndexError, update_label_index};
use iam_core::mapping::{MappingError, load_mapping};
use iam_core::session::SessionMode;
use iam_core::transport::SerialConnector;
use iam_core::writer::ReadingWriter;
use iam_core::{IngestError, IngestionSupervisor, RegistrySnapshot, SensorRegistry};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "iam_logger")]
#[command(about = "Registra leituras de monitores de energia CurrentCost")]
#[command(version)]
struct Cli {
    /// Arquivo de configuração (padrão: config.toml ao lado do executável)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Não desenha a tabela de status; grava stats.dat periodicamente
    #[arg(long)]
    no_display: bool,

    /// Apenas imprime o XML recebido de cada porta, sem gravar nada
    #[arg(long)]
    print_xml: bool,
}

/// Erros fatais do processo.
#[derive(Debug, thiserror::Error)]
enum LoggerError {
    #[error("Configuração inválida:\n  {}", .0.join("\n  "))]
    Config(Vec<String>),

    #[error("Erro ao criar diretório {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Labels(#[from] LabelIndexError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Interactive,
    Headless,
    RawXml,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Config ──
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    // ── Logging ── (stderr, para não misturar com a tabela no stdout)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logger.log_level.as_str().into()),
        )
        .init();

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &AppConfig) -> Result<(), LoggerError> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(LoggerError::Config(errors));
    }

    let output = if cli.print_xml {
        OutputMode::RawXml
    } else if cli.no_display || !std::io::stdout().is_terminal() {
        OutputMode::Headless
    } else {
        OutputMode::Interactive
    };

    // ── Mapeamento e labels ──
    let directory = &config.logger.directory;
    std::fs::create_dir_all(directory).map_err(|source| LoggerError::Directory {
        path: directory.clone(),
        source,
    })?;
    let mappings = load_mapping(&config.mapping_path())?;
    update_label_index(&config.labels_path(), &mappings)?;

    // ── Sessões ──
    let writer = ReadingWriter::new(directory).with_provenance(config.logger.write_provenance);
    let registry = Arc::new(SensorRegistry::new(writer, mappings));
    let mut supervisor = IngestionSupervisor::new(Arc::clone(&registry));

    let mode = match output {
        OutputMode::RawXml => SessionMode::EchoRaw,
        _ => SessionMode::Log,
    };
    for port in &config.logger.serial_ports {
        let connector =
            SerialConnector::new(port.as_str(), config.logger.baud_rate, config.read_timeout());
        supervisor.add(Box::new(connector), config.retry_policy(), mode);
    }

    // ── Sinais ──
    let cancel = supervisor.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || {
        cancel.cancel();
    }) {
        warn!("Não foi possível instalar handler de Ctrl+C: {e}");
    }

    // ── Banner ──
    info!(
        "Gravando em {} | {} porta(s) a {} baud | retry {}×{:.1}s",
        directory.display(),
        config.logger.serial_ports.len(),
        config.logger.baud_rate,
        config.retry.max_retries,
        config.retry.backoff_secs
    );
    println!("Press CTRL+C to stop.\n");

    supervisor.start();

    // ── Loop principal ──
    let tick = config.refresh_interval();
    let stats_interval = config.stats_interval();
    let stats_path = config.stats_path();
    let mut last_stats: Option<Instant> = None;

    while supervisor.wait(tick) && !supervisor.is_shutting_down() {
        match output {
            OutputMode::Interactive => {
                let mut stdout = std::io::stdout().lock();
                let _ = write!(
                    stdout,
                    "\x1b[2J\x1b[H{}Press CTRL+C to stop.\n",
                    status::render(&supervisor.snapshot())
                );
                let _ = stdout.flush();
            }
            OutputMode::Headless => {
                if last_stats.is_none_or(|t| t.elapsed() >= stats_interval) {
                    write_stats(&stats_path, &supervisor.snapshot());
                    last_stats = Some(Instant::now());
                }
            }
            OutputMode::RawXml => {}
        }
    }

    supervisor.request_shutdown();
    let result = supervisor.await_shutdown();

    if output == OutputMode::Headless {
        write_stats(&stats_path, &registry.snapshot());
    }
    info!("{} sensores registrados", registry.len());

    result.map_err(LoggerError::from)
}

fn write_stats(path: &Path, snapshot: &RegistrySnapshot) {
    if let Err(e) = status::write_stats_file(path, snapshot) {
        warn!("Erro ao gravar {}: {e}", path.display());
    }
}
