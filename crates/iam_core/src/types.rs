//! Tipos compartilhados entre decodificador, sessões e registry.

use std::fmt;

// ──────────────────────────────────────────────
// Identidade de sensores
// ──────────────────────────────────────────────

/// Identifica um sensor físico (um CT clamp ou um IAM).
///
/// O `<id>` do XML identifica o *transmissor*; cada transmissor de CT clamps
/// carrega até três sensores (`<ch1>`…`<ch3>`), por isso a chave é o par
/// (radio ID, sub-canal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorKey {
    /// Radio ID reportado pelo monitor (`<id>`). Não é garantidamente único.
    pub group_id: u32,
    /// Sub-canal do transmissor, o X de `<chX>` (1..=3).
    pub sub_channel: u8,
}

impl SensorKey {
    pub fn new(group_id: u32, sub_channel: u8) -> Self {
        Self {
            group_id,
            sub_channel,
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.sub_channel)
    }
}

/// Onde um sensor foi ouvido: monitor (porta) + canal local (`<sensor>`) + sub-canal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub port: String,
    pub local_channel: u32,
    pub sub_channel: u8,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.port, self.local_channel, self.sub_channel)
    }
}

// ──────────────────────────────────────────────
// Monitor
// ──────────────────────────────────────────────

/// Metadados do monitor obtidos no handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Firmware/versão (`<src>`, ex: "CC128-v0.11")
    pub version: Option<String>,
    /// Dias desde a primeira ligação (`<dsb>`)
    pub days_since_birth: Option<u32>,
}

/// Estado de um monitor exposto no snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub port: String,
    pub info: DeviceInfo,
}
