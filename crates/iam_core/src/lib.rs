//! # IAM Core
//!
//! Motor de ingestão dos monitores de energia CurrentCost: lê telegramas XML
//! de várias portas seriais em paralelo, deduplica as leituras entre
//! monitores e grava um arquivo `channel_<canal>.dat` por sensor.
//!
//! ## Módulos
//! - [`telegram`] – Decodificador XML → [`Telegram`]
//! - [`transport`] – Porta serial e traits de conexão
//! - [`session`] – Máquina de estados de uma porta (retry/reconexão)
//! - [`supervisor`] – Uma thread por porta, cancelamento e shutdown
//! - [`registry`] – Tabela compartilhada `SensorKey → SensorState`
//! - [`stats`] – Estatística incremental dos intervalos de chegada
//! - [`writer`] – Gravação deduplicada por segundo
//! - [`mapping`] – `radioIDs.dat`
//! - [`labels`] – `labels.dat`
//! - [`config`] – Configuração TOML

pub mod cancel;
pub mod config;
pub mod labels;
pub mod mapping;
pub mod registry;
pub mod session;
pub mod stats;
pub mod supervisor;
pub mod telegram;
pub mod transport;
pub mod types;
pub mod writer;

#[cfg(test)]
mod testing;

// Re-exports convenientes
pub use cancel::CancelToken;
pub use config::AppConfig;
pub use registry::{RegistrySnapshot, SensorRegistry, SensorState};
pub use session::{IngestError, PortSession, RetryPolicy, SessionMode};
pub use supervisor::IngestionSupervisor;
pub use telegram::{DecodeError, Telegram, decode_telegram};
pub use types::{DeviceInfo, Location, SensorKey};
