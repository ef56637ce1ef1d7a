//! Índice `labels.dat`: uma linha `<canal> <label>` por canal de saída.
//!
//! Gerado a partir do mapeamento e mesclado com a cópia existente: canais
//! que sumiram do mapeamento continuam no índice, canais do mapeamento
//! sobrescrevem os antigos. O arquivo só é regravado se o conteúdo mudar.

use crate::mapping::SensorMapping;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub type LabelIndex = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum LabelIndexError {
    #[error("Erro ao ler {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Erro ao gravar {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Índice canal → label do mapeamento.
pub fn label_index(mappings: &[SensorMapping]) -> LabelIndex {
    mappings
        .iter()
        .map(|m| (m.output_channel.clone(), m.label.clone()))
        .collect()
}

/// Lê um `labels.dat`. Arquivo inexistente → índice vazio.
pub fn read_label_index(path: &Path) -> Result<LabelIndex, LabelIndexError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LabelIndex::new()),
        Err(source) => {
            return Err(LabelIndexError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut index = LabelIndex::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => {}
            [channel, label] => {
                index.insert(channel.to_string(), label.to_string());
            }
            _ => warn!("{}: linha ignorada: {line:?}", path.display()),
        }
    }
    Ok(index)
}

fn render(index: &LabelIndex) -> String {
    index
        .iter()
        .map(|(channel, label)| format!("{channel} {label}\n"))
        .collect()
}

/// Mescla o mapeamento com o `labels.dat` existente e grava se mudou.
///
/// Retorna `true` se o arquivo foi gravado.
pub fn update_label_index(
    path: &Path,
    mappings: &[SensorMapping],
) -> Result<bool, LabelIndexError> {
    let existing = read_label_index(path)?;

    let mut merged = existing.clone();
    merged.extend(label_index(mappings));

    if merged == existing && path.exists() {
        info!("{} já contém todos os labels", path.display());
        return Ok(false);
    }

    std::fs::write(path, render(&merged)).map_err(|source| LabelIndexError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("{} atualizado ({} canais)", path.display(), merged.len());
    Ok(true)
}
