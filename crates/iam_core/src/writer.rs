//! Gravação das leituras em arquivos append-only por sensor.
//!
//! Formato de cada linha de `channel_<id>.dat`:
//!
//! ```text
//! <unix_seconds> <watts> [<porta> <canal_local>]
//! ```
//!
//! No máximo uma linha por segundo por sensor: vários monitores ouvindo o
//! mesmo sensor (ou um computador lento para drenar a serial) produzem
//! chegadas repetidas no mesmo segundo.

use crate::registry::SensorState;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Erro ao gravar no arquivo de um sensor.
#[derive(Debug, thiserror::Error)]
#[error("Erro ao gravar em {path}: {source}")]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Resultado de um [`ReadingWriter::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { timestamp: i64 },
    /// Timestamp já gravado para este sensor.
    Duplicate { timestamp: i64 },
}

// ──────────────────────────────────────────────
// Fila por arquivo
// ──────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordem de gravação de um arquivo: senhas emitidas na reserva, atendidas
/// em sequência. Nenhum lock fica preso durante o I/O.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    issued: AtomicU64,
    served: Mutex<u64>,
    turn: Condvar,
}

impl WriteQueue {
    pub(crate) fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    /// Espera a vez de `ticket` e executa `f`. A vez passa adiante mesmo se `f` falhar.
    pub(crate) fn run<T>(&self, ticket: u64, f: impl FnOnce() -> T) -> T {
        let mut served = lock(&self.served);
        while *served != ticket {
            served = self.turn.wait(served).unwrap_or_else(PoisonError::into_inner);
        }
        drop(served);

        let _next = NextTurn(self);
        f()
    }
}

struct NextTurn<'a>(&'a WriteQueue);

impl Drop for NextTurn<'_> {
    fn drop(&mut self) {
        *lock(&self.0.served) += 1;
        self.0.turn.notify_all();
    }
}

/// Linha reservada sob o lock do registry, gravada depois dele.
///
/// Toda reserva precisa passar por [`ReadingWriter::write`], senão a fila
/// do arquivo para.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub(crate) path: PathBuf,
    line: String,
    pub(crate) timestamp: i64,
    /// `last_written` antes da reserva, para desfazer em caso de falha
    pub(crate) previous: Option<i64>,
    queue: Arc<WriteQueue>,
    ticket: u64,
}

#[derive(Debug)]
pub(crate) enum WritePlan {
    Duplicate { timestamp: i64 },
    Append(PendingWrite),
}

// ──────────────────────────────────────────────
// Writer
// ──────────────────────────────────────────────

/// Grava leituras no diretório de saída.
#[derive(Debug)]
pub struct ReadingWriter {
    directory: PathBuf,
    write_provenance: bool,
    queues: Mutex<HashMap<PathBuf, Arc<WriteQueue>>>,
}

impl ReadingWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_provenance: true,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Inclui (ou não) porta e canal local em cada linha.
    pub fn with_provenance(mut self, enabled: bool) -> Self {
        self.write_provenance = enabled;
        self
    }

    /// Caminho do arquivo de dados de um sensor.
    pub fn path_for(&self, state: &SensorState) -> PathBuf {
        self.directory
            .join(format!("channel_{}.dat", state.output_id()))
    }

    pub(crate) fn queue_for(&self, path: &Path) -> Arc<WriteQueue> {
        Arc::clone(lock(&self.queues).entry(path.to_path_buf()).or_default())
    }

    /// Decide se a leitura é gravada e reserva o timestamp. Não faz I/O.
    ///
    /// O timestamp é o último instante de chegada arredondado para segundos.
    pub(crate) fn plan(&self, state: &mut SensorState, value: i64) -> WritePlan {
        // O registry sempre atualiza as estatísticas antes de gravar.
        let timestamp = state.stats.last_seen().map_or(0, |t| t.round() as i64);

        if state.last_written == Some(timestamp) {
            info!(
                "SENSOR: timestamp {timestamp} já gravado. label={}, watts={value}, location={}",
                state.label,
                state
                    .location
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string)
            );
            return WritePlan::Duplicate { timestamp };
        }

        let line = match (&state.location, self.write_provenance) {
            (Some(loc), true) => {
                format!("{timestamp} {value} {} {}\n", loc.port, loc.local_channel)
            }
            _ => format!("{timestamp} {value}\n"),
        };

        let path = self.path_for(state);
        let queue = self.queue_for(&path);
        let ticket = queue.ticket();
        let previous = state.last_written.replace(timestamp);

        WritePlan::Append(PendingWrite {
            path,
            line,
            timestamp,
            previous,
            queue,
            ticket,
        })
    }

    /// Grava uma linha reservada, na ordem de reserva do arquivo.
    pub(crate) fn write(&self, pending: PendingWrite) -> Result<(), WriteError> {
        let PendingWrite {
            path,
            line,
            queue,
            ticket,
            ..
        } = pending;

        queue.run(ticket, || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| file.write_all(line.as_bytes()))
                .map_err(|source| WriteError { path, source })
        })
    }

    /// Reserva e grava em um passo, para quem já tem acesso exclusivo ao estado.
    pub fn append(&self, state: &mut SensorState, value: i64) -> Result<WriteOutcome, WriteError> {
        match self.plan(state, value) {
            WritePlan::Duplicate { timestamp } => Ok(WriteOutcome::Duplicate { timestamp }),
            WritePlan::Append(pending) => {
                let (timestamp, previous) = (pending.timestamp, pending.previous);
                if let Err(e) = self.write(pending) {
                    state.last_written = previous;
                    return Err(e);
                }
                Ok(WriteOutcome::Written { timestamp })
            }
        }
    }
}
