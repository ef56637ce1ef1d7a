//! Transporte serial – abertura da porta e montagem de linhas.
//!
//! A sessão só enxerga os traits [`Connector`] e [`LineSource`]; a
//! implementação real usa `serialport`, os testes usam transportes roteirizados.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read};
use std::time::Duration;

/// Baud rate fixo dos monitores CurrentCost.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Limite de bytes acumulados sem `\n` antes de entregar a linha assim mesmo.
const MAX_LINE_BYTES: usize = 4096;

/// Erros de transporte.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Falha ao abrir porta serial {port}: {source}. A porta correta está configurada?")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("Erro de I/O na porta serial: {0}")]
    Io(#[from] io::Error),
}

/// Abre (e reabre) a conexão física de uma porta.
pub trait Connector: Send {
    /// Identificador da porta (ex: "/dev/ttyUSB0").
    fn port(&self) -> &str;

    /// Abre a porta e descarta a entrada antiga.
    fn open(&mut self) -> Result<Box<dyn LineSource>, TransportError>;
}

/// Conexão aberta que entrega linhas.
pub trait LineSource: Send {
    /// Próxima linha completa, sem o terminador.
    ///
    /// `Ok(None)` quando o timeout de leitura expira sem linha completa;
    /// não é erro, apenas devolve o controle para checar cancelamento.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Descarta o buffer de entrada.
    fn clear_input(&mut self) -> io::Result<()>;
}

// ──────────────────────────────────────────────
// Montagem de linhas
// ──────────────────────────────────────────────

/// Acumula bytes parciais entre leituras até encontrar `\n`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Retira a próxima linha completa, se houver.
    pub fn next_line(&mut self) -> Option<String> {
        let end = match self.pending.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None if self.pending.len() >= MAX_LINE_BYTES => self.pending.len(),
            None => return None,
        };
        let raw: Vec<u8> = self.pending.drain(..end).collect();
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ──────────────────────────────────────────────
// Serial real
// ──────────────────────────────────────────────

/// Abre portas seriais via `serialport`.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout,
        }
    }
}

impl Connector for SerialConnector {
    fn port(&self) -> &str {
        &self.port
    }

    fn open(&mut self) -> Result<Box<dyn LineSource>, TransportError> {
        let port = serialport::new(self.port.as_str(), self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| TransportError::Open {
                port: self.port.clone(),
                source: e.into(),
            })?;

        let mut lines = SerialLines {
            port,
            buffer: LineBuffer::default(),
        };
        lines.clear_input()?;
        Ok(Box::new(lines))
    }
}

struct SerialLines {
    port: Box<dyn SerialPort>,
    buffer: LineBuffer,
}

impl LineSource for SerialLines {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(Some(line));
            }
            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buffer.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
