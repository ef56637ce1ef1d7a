//! Mapeamento radio ID → canal de saída/label (`radioIDs.dat`).
//!
//! Uma linha por sensor, `#` inicia comentário:
//!
//! ```text
//! # canal  label      radio_id[/sub_canal]  [NEVER_ZERO]
//! 1        aggregate  2577/1                NEVER_ZERO
//! 2        tv         9
//! ```
//!
//! Sub-canal padrão = 1. Radio IDs ou canais duplicados são erro fatal de
//! configuração; arquivo inexistente não é (sensores ficam sem label).

use crate::types::SensorKey;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Token que marca sensores que nunca leem zero.
pub const NEVER_ZERO_TOKEN: &str = "NEVER_ZERO";

/// Erros de carregamento do mapeamento.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("Erro ao ler {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Linha {line} do mapeamento: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Radio ID {key} duplicado no mapeamento (labels: {})", labels.join(", "))]
    DuplicateKey { key: SensorKey, labels: Vec<String> },

    #[error("Canal {channel} duplicado no mapeamento (labels: {})", labels.join(", "))]
    DuplicateChannel { channel: String, labels: Vec<String> },
}

/// Um sensor configurado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorMapping {
    /// Canal de saída; forma o nome do arquivo `channel_<canal>.dat`
    pub output_channel: String,
    pub label: String,
    pub key: SensorKey,
    /// Leitura exatamente zero é falha do transdutor e deve ser descartada
    pub never_zero: bool,
}

/// Carrega o arquivo de mapeamento. Arquivo inexistente → lista vazia.
pub fn load_mapping(path: &Path) -> Result<Vec<SensorMapping>, MappingError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{} não encontrado; sensores ficarão sem label", path.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(MappingError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mappings = parse_mapping(&content)?;
    info!("{} sensores mapeados em {}", mappings.len(), path.display());
    Ok(mappings)
}

/// Faz o parse e valida duplicatas.
pub fn parse_mapping(content: &str) -> Result<Vec<SensorMapping>, MappingError> {
    let mut mappings = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let data = raw.split('#').next().unwrap_or_default();
        let fields: Vec<&str> = data.split_whitespace().collect();

        match fields.len() {
            0 => continue,
            3 | 4 => {}
            n => {
                warn!("Linha {line} do mapeamento ignorada: {n} campos ({raw:?})");
                continue;
            }
        }

        let never_zero = match fields.get(3) {
            Some(&NEVER_ZERO_TOKEN) => true,
            Some(other) => {
                warn!("Linha {line}: token desconhecido {other:?} ignorado");
                false
            }
            None => false,
        };

        mappings.push(SensorMapping {
            output_channel: fields[0].to_string(),
            label: fields[1].to_string(),
            key: parse_key(fields[2], line)?,
            never_zero,
        });
    }

    check_duplicates(&mappings)?;
    Ok(mappings)
}

fn parse_key(field: &str, line: usize) -> Result<SensorKey, MappingError> {
    let (id, sub) = field.split_once('/').unwrap_or((field, ""));

    let group_id = id.parse().map_err(|_| MappingError::Parse {
        line,
        reason: format!("radio ID inválido: {id:?}"),
    })?;
    let sub_channel = if sub.is_empty() {
        1
    } else {
        sub.parse().map_err(|_| MappingError::Parse {
            line,
            reason: format!("sub-canal inválido: {sub:?}"),
        })?
    };

    Ok(SensorKey::new(group_id, sub_channel))
}

fn check_duplicates(mappings: &[SensorMapping]) -> Result<(), MappingError> {
    let mut by_key: BTreeMap<SensorKey, Vec<String>> = BTreeMap::new();
    let mut by_channel: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for m in mappings {
        by_key.entry(m.key).or_default().push(m.label.clone());
        by_channel
            .entry(m.output_channel.as_str())
            .or_default()
            .push(m.label.clone());
    }

    if let Some((key, labels)) = by_key.into_iter().find(|(_, l)| l.len() > 1) {
        return Err(MappingError::DuplicateKey { key, labels });
    }
    if let Some((channel, labels)) = by_channel.into_iter().find(|(_, l)| l.len() > 1) {
        return Err(MappingError::DuplicateChannel {
            channel: channel.to_string(),
            labels,
        });
    }
    Ok(())
}
