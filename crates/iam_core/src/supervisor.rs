//! Supervisor de ingestão: uma thread por porta serial.
//!
//! Qualquer erro fatal de um worker cancela o token compartilhado, e as
//! outras sessões encerram na próxima leitura. Os workers avisam o término
//! por um channel, usado pelo loop principal como tick de status.

use crate::cancel::CancelToken;
use crate::registry::{RegistrySnapshot, SensorRegistry};
use crate::session::{IngestError, PortSession, RetryPolicy, SessionMode};
use crate::transport::Connector;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Término de um worker.
#[derive(Debug)]
pub struct WorkerExit {
    pub port: String,
    pub result: Result<(), IngestError>,
}

struct Worker {
    port: String,
    handle: JoinHandle<()>,
}

/// Inicia, cancela e aguarda as sessões.
pub struct IngestionSupervisor {
    registry: Arc<SensorRegistry>,
    cancel: CancelToken,
    pending: Vec<PortSession>,
    workers: Vec<Worker>,
    launched: usize,
    exit_tx: Sender<WorkerExit>,
    exit_rx: Receiver<WorkerExit>,
    finished: usize,
    first_error: Option<IngestError>,
}

impl IngestionSupervisor {
    pub fn new(registry: Arc<SensorRegistry>) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        Self {
            registry,
            cancel: CancelToken::new(),
            pending: Vec::new(),
            workers: Vec::new(),
            launched: 0,
            exit_tx,
            exit_rx,
            finished: 0,
            first_error: None,
        }
    }

    /// Token compartilhado; cancelá-lo equivale a `request_shutdown()`.
    ///
    /// Seguro para o handler de sinal: só faz um store atômico.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    /// Registra uma porta para iniciar em [`start`](Self::start).
    pub fn add(&mut self, connector: Box<dyn Connector>, policy: RetryPolicy, mode: SessionMode) {
        let session = PortSession::new(connector, Arc::clone(&self.registry), self.cancel.clone())
            .with_policy(policy)
            .with_mode(mode);
        self.pending.push(session);
    }

    /// Quantidade de sessões registradas (iniciadas ou não).
    pub fn len(&self) -> usize {
        self.pending.len() + self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inicia uma thread por sessão pendente.
    pub fn start(&mut self) {
        for session in self.pending.drain(..) {
            self.launched += 1;
            let port = session.port().to_string();
            let tx = self.exit_tx.clone();
            let cancel = self.cancel.clone();
            let worker_port = port.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("cc_{}", thread_suffix(&port)))
                .spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| session.run()))
                        .unwrap_or_else(|_| {
                            Err(IngestError::WorkerPanicked {
                                port: worker_port.clone(),
                            })
                        });

                    match &result {
                        Ok(()) => info!("Monitor {worker_port} encerrado"),
                        Err(e) => {
                            error!("Monitor {worker_port}: {e}");
                            if cancel.cancel() {
                                info!("Encerrando todos os monitores");
                            }
                        }
                    }
                    // O receiver vive no supervisor; falha aqui só ocorre após o drop dele
                    let _ = tx.send(WorkerExit {
                        port: worker_port,
                        result,
                    });
                });

            match spawned {
                Ok(handle) => {
                    info!("Thread de leitura iniciada para {port}");
                    self.workers.push(Worker { port, handle });
                }
                Err(source) => {
                    error!("Falha ao criar thread para {port}: {source}");
                    self.cancel.cancel();
                    let _ = self.exit_tx.send(WorkerExit {
                        port: port.clone(),
                        result: Err(IngestError::Spawn { port, source }),
                    });
                }
            }
        }
    }

    /// Pede o encerramento cooperativo. Idempotente.
    pub fn request_shutdown(&self) {
        if self.cancel.cancel() {
            info!("Encerramento solicitado");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Espera até `timeout` por términos de workers.
    ///
    /// Retorna `true` enquanto ainda houver workers rodando.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.exit_rx.recv_timeout(timeout) {
            Ok(exit) => {
                self.record(exit);
                while let Ok(exit) = self.exit_rx.try_recv() {
                    self.record(exit);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
        self.finished < self.launched
    }

    /// Junta todas as threads. Depois disso nenhuma porta está aberta e o
    /// registry não muda mais. Retorna o primeiro erro fatal, se houver.
    pub fn await_shutdown(mut self) -> Result<(), IngestError> {
        for worker in std::mem::take(&mut self.workers) {
            info!("Aguardando monitor {} encerrar...", worker.port);
            if worker.handle.join().is_err() {
                // catch_unwind cobre a sessão; resta pânico no próprio envio
                self.record(WorkerExit {
                    result: Err(IngestError::WorkerPanicked {
                        port: worker.port.clone(),
                    }),
                    port: worker.port,
                });
            }
        }

        while let Ok(exit) = self.exit_rx.try_recv() {
            self.record(exit);
        }

        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cópia do estado atual de monitores e sensores.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    fn record(&mut self, exit: WorkerExit) {
        self.finished += 1;
        if let Err(e) = exit.result {
            if self.first_error.is_none() {
                self.first_error = Some(e);
            }
        }
    }
}

/// Último componente do caminho da porta (`/dev/ttyUSB0` → `ttyUSB0`).
fn thread_suffix(port: &str) -> &str {
    port.rsplit(['/', '\\']).next().unwrap_or(port)
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
