//! Sessão de uma porta serial – máquina de estados de leitura e recuperação.
//!
//! ```text
//! Closed ─open()─▶ Opening ─▶ Ready ─handshake()─▶ Reading ⇄ Faulted ─▶ Closed
//! ```
//!
//! - Falha ao abrir a porta é fatal (porta errada na configuração).
//! - Erro de I/O, XML malformado ou campo ausente → `Faulted`: espera o
//!   backoff, limpa a entrada, fecha e reabre a porta. O contador de
//!   tentativas é por leitura, zerado a cada telegrama válido.
//! - Depois de `max_retries` falhas consecutivas a sessão desiste com
//!   [`IngestError::RetriesExhausted`]: provavelmente é falha de hardware.
//! - Histogramas não são erro e não consomem tentativas.

use crate::cancel::CancelToken;
use crate::registry::SensorRegistry;
use crate::telegram::{DecodeError, Payload, Telegram, decode_telegram, parse_payload};
use crate::transport::{Connector, LineSource, TransportError};
use crate::types::DeviceInfo;
use crate::writer::WriteError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tentativas consecutivas antes de desistir.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Espera antes de cada reconexão.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Política de retry de uma sessão.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Estados da sessão.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Ready,
    Reading,
    /// Falha `attempt` de `max_retries` na leitura atual
    Faulted { attempt: u32 },
}

/// O que fazer com as linhas lidas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Decodifica e registra leituras
    #[default]
    Log,
    /// Apenas imprime o XML bruto no stdout
    EchoRaw,
}

/// Motivo de uma falha de leitura.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("erro de I/O: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Decode(#[from] DecodeError),
}

/// Erros fatais de ingestão.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Porta {port}: leitura falhou após {attempts} tentativas (último erro: {last})")]
    RetriesExhausted {
        port: String,
        attempts: u32,
        #[source]
        last: Fault,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Falha ao criar thread para {port}: {source}")]
    Spawn {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("Thread da porta {port} entrou em pânico")]
    WorkerPanicked { port: String },
}

// ──────────────────────────────────────────────
// Sessão
// ──────────────────────────────────────────────

/// Registro do handshake: aceito se identifica o monitor ou se é leitura.
fn decode_handshake(line: &str) -> Result<(Payload, Option<Telegram>), DecodeError> {
    let payload = parse_payload(line)?;
    match Telegram::from_payload(&payload) {
        Ok(telegram) => Ok((payload, Some(telegram))),
        Err(_) if payload.device_info().is_some() => Ok((payload, None)),
        Err(e) => Err(e),
    }
}

/// Conexão com um monitor CurrentCost.
pub struct PortSession {
    port: String,
    connector: Box<dyn Connector>,
    source: Option<Box<dyn LineSource>>,
    state: SessionState,
    policy: RetryPolicy,
    mode: SessionMode,
    registry: Arc<SensorRegistry>,
    cancel: CancelToken,
    device: Option<DeviceInfo>,
    reconnects: u32,
}

impl PortSession {
    pub fn new(
        connector: Box<dyn Connector>,
        registry: Arc<SensorRegistry>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            port: connector.port().to_string(),
            connector,
            source: None,
            state: SessionState::Closed,
            policy: RetryPolicy::default(),
            mode: SessionMode::default(),
            registry,
            cancel,
            device: None,
            reconnects: 0,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Metadados do monitor, após o handshake.
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Ciclos de reconexão executados desde a criação.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// `Closed → Opening → Ready`. Falha aqui é fatal.
    pub fn open(&mut self) -> Result<(), IngestError> {
        self.state = SessionState::Opening;
        info!("SERIAL: abrindo porta {}", self.port);
        match self.connector.open() {
            Ok(source) => {
                self.source = Some(source);
                self.state = SessionState::Ready;
                info!("SERIAL: porta {} aberta", self.port);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e.into())
            }
        }
    }

    /// Lê registros até encontrar a identificação do monitor (`src`/`dsb`).
    ///
    /// Leituras que chegam nesse meio tempo são registradas normalmente.
    /// Um registro sem identificação que também não é leitura conta como
    /// falha, como no laço de leitura. Retorna `None` se cancelado antes.
    pub fn handshake(&mut self) -> Result<Option<DeviceInfo>, IngestError> {
        while let Some((payload, telegram)) = self.next_decoded(decode_handshake)? {
            if let (SessionMode::Log, Some(telegram)) = (self.mode, &telegram) {
                self.registry.ingest(&self.port, telegram)?;
            }
            if let Some(info) = payload.device_info() {
                info!(
                    "Monitor em {}: versão {}, DSB {}",
                    self.port,
                    info.version.as_deref().unwrap_or("-"),
                    info.days_since_birth
                        .map_or_else(|| "-".to_string(), |d| d.to_string())
                );
                self.registry.register_device(&self.port, info.clone());
                self.device = Some(info.clone());
                return Ok(Some(info));
            }
            debug!("{}: registro sem identificação, aguardando outro", self.port);
        }
        Ok(None)
    }

    /// Próximo telegrama de leitura válido, com retry.
    ///
    /// `Ok(None)` quando cancelado.
    pub fn next_telegram(&mut self) -> Result<Option<Telegram>, IngestError> {
        self.next_decoded(decode_telegram)
    }

    /// Executa a sessão até cancelamento ou erro fatal. Sempre termina `Closed`.
    pub fn run(mut self) -> Result<(), IngestError> {
        let result = self.run_loop();
        self.close();
        result
    }

    fn run_loop(&mut self) -> Result<(), IngestError> {
        if self.source.is_none() {
            self.open()?;
        }
        self.handshake()?;

        while !self.cancel.is_cancelled() {
            match self.mode {
                SessionMode::Log => {
                    if let Some(telegram) = self.next_telegram()? {
                        self.registry.ingest(&self.port, &telegram)?;
                    }
                }
                SessionMode::EchoRaw => {
                    if let Some(line) = self.next_decoded(|l| Ok(l.to_string()))? {
                        println!("{}\n{}", self.port, line);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fecha a porta. Idempotente.
    pub fn close(&mut self) {
        if self.source.take().is_some() {
            info!("SERIAL: porta {} fechada", self.port);
        }
        self.state = SessionState::Closed;
    }

    // ──────────────────────────────────────────
    // Retry
    // ──────────────────────────────────────────

    /// Lê e decodifica uma linha com a política de retry. Único dono do
    /// contador de tentativas.
    fn next_decoded<T, F>(&mut self, decode: F) -> Result<Option<T>, IngestError>
    where
        F: Fn(&str) -> Result<T, DecodeError>,
    {
        let mut attempt = 0;

        while !self.cancel.is_cancelled() {
            let fault = match self.read_line() {
                Ok(None) => continue, // timeout de leitura
                Ok(Some(line)) => match decode(&line) {
                    Ok(value) => {
                        self.state = SessionState::Reading;
                        return Ok(Some(value));
                    }
                    Err(DecodeError::Ignorable) => {
                        debug!("{}: histograma ignorado", self.port);
                        continue;
                    }
                    Err(e) => {
                        warn!("XML: {}: {e}\n   {line}", self.port);
                        Fault::Decode(e)
                    }
                },
                Err(e) => {
                    warn!("SERIAL: erro de leitura em {}: {e}", self.port);
                    Fault::Io(e)
                }
            };

            attempt += 1;
            self.state = SessionState::Faulted { attempt };
            self.recover(attempt);

            if attempt >= self.policy.max_retries {
                return Err(IngestError::RetriesExhausted {
                    port: self.port.clone(),
                    attempts: attempt,
                    last: fault,
                });
            }
        }

        Ok(None)
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.source.as_mut() {
            Some(source) => source.read_line(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "porta serial não está aberta",
            )),
        }
    }

    /// Backoff, limpeza da entrada e reconexão completa. Erros aqui são
    /// ignorados: a próxima leitura decide.
    fn recover(&mut self, attempt: u32) {
        std::thread::sleep(self.policy.backoff);
        warn!(
            "SERIAL: {}: tentativa {attempt} de {}",
            self.port, self.policy.max_retries
        );

        if let Some(source) = self.source.as_mut() {
            if let Err(e) = source.clear_input() {
                debug!("{}: falha ao limpar entrada: {e}", self.port);
            }
        }

        self.source = None;
        self.reconnects += 1;
        match self.connector.open() {
            Ok(source) => self.source = Some(source),
            Err(e) => debug!("{}: reabertura falhou: {e}", self.port),
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
