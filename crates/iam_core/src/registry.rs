//! Registry de sensores compartilhado entre todas as sessões.
//!
//! Um único `Mutex` protege a tabela `SensorKey → SensorState`; os chamadores
//! nunca manipulam locks. O volume é de poucas leituras por segundo por
//! sensor, então serializar todas as atualizações é suficiente.
//!
//! A gravação em disco acontece depois que o lock é solto. Sob o lock só se
//! reserva o segundo e a vez na fila do arquivo.

use crate::mapping::SensorMapping;
use crate::stats::RunningStats;
use crate::telegram::Telegram;
use crate::types::{DeviceInfo, DeviceStatus, Location, SensorKey};
use crate::writer::{ReadingWriter, WriteError, WritePlan};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

// ──────────────────────────────────────────────
// Estado por sensor
// ──────────────────────────────────────────────

/// Estado de um sensor físico, criado na primeira leitura.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    pub key: SensorKey,
    /// Label do mapeamento; radio ID quando não mapeado
    pub label: String,
    /// Canal de saída do mapeamento
    pub output_channel: Option<String>,
    pub never_zero: bool,
    pub stats: RunningStats,
    pub last_value: Option<i64>,
    /// Último lugar em que o sensor foi ouvido
    pub location: Option<Location>,
    /// Quantas vezes o sensor foi ouvido em cada lugar
    pub locations: BTreeMap<Location, u64>,
    /// Último timestamp (segundos) gravado em disco
    pub last_written: Option<i64>,
}

impl SensorState {
    /// Sensor descoberto em tempo de execução, sem mapeamento.
    pub fn unmapped(key: SensorKey) -> Self {
        Self {
            key,
            label: key.group_id.to_string(),
            output_channel: None,
            never_zero: false,
            stats: RunningStats::new(),
            last_value: None,
            location: None,
            locations: BTreeMap::new(),
            last_written: None,
        }
    }

    pub fn from_mapping(mapping: &SensorMapping) -> Self {
        Self {
            label: mapping.label.clone(),
            output_channel: Some(mapping.output_channel.clone()),
            never_zero: mapping.never_zero,
            ..Self::unmapped(mapping.key)
        }
    }

    /// Identificador usado no nome do arquivo de saída.
    pub fn output_id(&self) -> String {
        self.output_channel
            .clone()
            .unwrap_or_else(|| self.key.group_id.to_string())
    }
}

/// Resultado de uma atualização.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    /// Mesmo segundo já gravado (eco de outro monitor)
    Duplicate,
    /// Zero descartado pela política NEVER_ZERO
    RejectedZero,
}

/// Cópia do estado para exibição.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub devices: Vec<DeviceStatus>,
    pub sensors: Vec<SensorState>,
}

// ──────────────────────────────────────────────
// Registry
// ──────────────────────────────────────────────

#[derive(Default)]
struct RegistryInner {
    sensors: BTreeMap<SensorKey, SensorState>,
    devices: BTreeMap<String, DeviceInfo>,
}

/// Fonte única da verdade `SensorKey → SensorState`.
pub struct SensorRegistry {
    inner: Mutex<RegistryInner>,
    mappings: HashMap<SensorKey, SensorMapping>,
    writer: ReadingWriter,
}

impl SensorRegistry {
    pub fn new(writer: ReadingWriter, mappings: Vec<SensorMapping>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            mappings: mappings.into_iter().map(|m| (m.key, m)).collect(),
            writer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // Nenhuma atualização deixa o estado pela metade, então um lock
        // envenenado ainda é utilizável.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Processa uma leitura recebida agora.
    pub fn update(
        &self,
        key: SensorKey,
        value: i64,
        port: &str,
        local_channel: u32,
    ) -> Result<UpdateOutcome, WriteError> {
        self.update_at(key, value, port, local_channel, SystemTime::now())
    }

    /// Processa uma leitura com o instante de recebimento informado.
    ///
    /// O instante é sempre o relógio local: o relógio do monitor não é confiável.
    pub fn update_at(
        &self,
        key: SensorKey,
        value: i64,
        port: &str,
        local_channel: u32,
        received: SystemTime,
    ) -> Result<UpdateOutcome, WriteError> {
        let now = received
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let pending = {
            let mut inner = self.lock();
            let state = inner.sensors.entry(key).or_insert_with(|| {
                match self.mappings.get(&key) {
                    Some(m) => {
                        info!("Sensor {key} ({}) visto pela primeira vez em {port}", m.label);
                        SensorState::from_mapping(m)
                    }
                    None => {
                        info!("Novo sensor não mapeado: radio ID {key} em {port}");
                        SensorState::unmapped(key)
                    }
                }
            });

            // O monitor às vezes reporta 0 W para sensores que nunca zeram
            // (ex: agregado da casa). Trata como falha, não como leitura.
            if state.never_zero && value == 0 {
                info!(
                    "Sensor {} ({key}) reportou 0 W em {port}; descartado (NEVER_ZERO)",
                    state.label
                );
                return Ok(UpdateOutcome::RejectedZero);
            }

            state.stats.record_arrival(now);
            state.last_value = Some(value);

            let location = Location {
                port: port.to_string(),
                local_channel,
                sub_channel: key.sub_channel,
            };
            *state.locations.entry(location.clone()).or_insert(0) += 1;
            state.location = Some(location);

            match self.writer.plan(state, value) {
                WritePlan::Duplicate { .. } => return Ok(UpdateOutcome::Duplicate),
                WritePlan::Append(pending) => pending,
            }
        };

        let (timestamp, previous) = (pending.timestamp, pending.previous);
        if let Err(e) = self.writer.write(pending) {
            // Libera o segundo para a próxima chegada, a menos que outra
            // leitura já tenha reservado um segundo depois deste.
            if let Some(state) = self.lock().sensors.get_mut(&key) {
                if state.last_written == Some(timestamp) {
                    state.last_written = previous;
                }
            }
            return Err(e);
        }
        Ok(UpdateOutcome::Written)
    }

    /// Encaminha todas as leituras de um telegrama, com um único instante.
    pub fn ingest(&self, port: &str, telegram: &Telegram) -> Result<(), WriteError> {
        let received = SystemTime::now();
        for reading in &telegram.readings {
            let key = SensorKey::new(telegram.group_id, reading.sub_channel);
            self.update_at(key, reading.watts, port, telegram.local_channel, received)?;
        }
        Ok(())
    }

    /// Registra os metadados obtidos no handshake de um monitor.
    pub fn register_device(&self, port: &str, info: DeviceInfo) {
        self.lock().devices.insert(port.to_string(), info);
    }

    pub fn len(&self) -> usize {
        self.lock().sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estado de um sensor (cópia).
    pub fn get(&self, key: SensorKey) -> Option<SensorState> {
        self.lock().sensors.get(&key).cloned()
    }

    /// Cópia consistente de todos os monitores e sensores.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();
        RegistrySnapshot {
            devices: inner
                .devices
                .iter()
                .map(|(port, info)| DeviceStatus {
                    port: port.clone(),
                    info: info.clone(),
                })
                .collect(),
            sensors: inner.sensors.values().cloned().collect(),
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::decode_telegram;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    fn never_zero_11() -> SensorMapping {
        SensorMapping {
            output_channel: "1".into(),
            label: "aggregate".into(),
            key: SensorKey::new(11, 1),
            never_zero: true,
        }
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn same_second_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]);
        let key = SensorKey::new(11, 1);

        let first = registry.update_at(key, 150, "/dev/ttyUSB0", 1, at(1_700_000_000_100));
        let second = registry.update_at(key, 151, "/dev/ttyUSB0", 1, at(1_700_000_000_400));
        assert_eq!(first.unwrap(), UpdateOutcome::Written);
        assert_eq!(second.unwrap(), UpdateOutcome::Duplicate);

        let lines = read_lines(&dir.path().join("channel_11.dat"));
        assert_eq!(lines, vec!["1700000000 150 /dev/ttyUSB0 1"]);

        // A estatística continua contando a chegada duplicada
        let state = registry.get(key).unwrap();
        assert_eq!(state.stats.count(), 1);
        assert_eq!(state.last_value, Some(151));
    }

    #[test]
    fn never_zero_scenario_keeps_only_nonzero_line() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            SensorRegistry::new(ReadingWriter::new(dir.path()), vec![never_zero_11()]);
        let stream = [
            "<r><id>11</id><sensor>1</sensor><ch1/watts>150</ch1/watts></r>",
            "<r><id>11</id><sensor>1</sensor><ch1/watts>0</ch1/watts></r>",
        ];

        let mut outcomes = Vec::new();
        for (i, line) in stream.iter().enumerate() {
            let t = decode_telegram(line).unwrap();
            let r = t.readings[0];
            let key = SensorKey::new(t.group_id, r.sub_channel);
            let when = at(1_700_000_000_000 + 6_000 * i as u64);
            outcomes.push(
                registry
                    .update_at(key, r.watts, "/dev/ttyUSB0", t.local_channel, when)
                    .unwrap(),
            );
        }

        assert_eq!(outcomes, vec![UpdateOutcome::Written, UpdateOutcome::RejectedZero]);
        let lines = read_lines(&dir.path().join("channel_1.dat"));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("1700000000 150"));

        let state = registry.get(SensorKey::new(11, 1)).unwrap();
        assert_eq!(state.stats.count(), 0);
        assert_eq!(state.last_value, Some(150));
        assert_eq!(state.label, "aggregate");
    }

    #[test]
    fn never_zero_on_first_sighting_leaves_state_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            SensorRegistry::new(ReadingWriter::new(dir.path()), vec![never_zero_11()]);
        let outcome = registry
            .update_at(SensorKey::new(11, 1), 0, "/dev/ttyUSB0", 1, at(5_000))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::RejectedZero);

        let state = registry.get(SensorKey::new(11, 1)).unwrap();
        assert_eq!(state.stats.last_seen(), None);
        assert_eq!(state.last_value, None);
        assert!(state.locations.is_empty());
        assert!(!dir.path().join("channel_1.dat").exists());
    }

    #[test]
    fn zero_is_recorded_without_policy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]);
        let outcome = registry
            .update_at(SensorKey::new(11, 1), 0, "/dev/ttyUSB0", 1, at(5_000))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Written);
    }

    #[test]
    fn echo_from_two_devices_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]);
        let key = SensorKey::new(11, 1);

        registry
            .update_at(key, 200, "/dev/ttyUSB0", 1, at(1_700_000_000_200))
            .unwrap();
        registry
            .update_at(key, 200, "/dev/ttyUSB1", 4, at(1_700_000_000_300))
            .unwrap();

        let lines = read_lines(&dir.path().join("channel_11.dat"));
        assert_eq!(lines, vec!["1700000000 200 /dev/ttyUSB0 1"]);

        let state = registry.get(key).unwrap();
        assert_eq!(state.locations.len(), 2);
        assert!(state.locations.values().all(|&n| n == 1));
        assert_eq!(state.location.unwrap().port, "/dev/ttyUSB1");
    }

    #[test]
    fn location_multiset_counts_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]);
        let key = SensorKey::new(7, 2);
        for i in 0..3 {
            registry
                .update_at(key, 10, "/dev/ttyUSB0", 5, at(10_000 + 6_000 * i))
                .unwrap();
        }
        let state = registry.get(key).unwrap();
        let loc = Location {
            port: "/dev/ttyUSB0".into(),
            local_channel: 5,
            sub_channel: 2,
        };
        assert_eq!(state.locations.get(&loc), Some(&3));
        assert_eq!(state.stats.count(), 2);
        assert_eq!(state.stats.mean(), Some(6.0));
        assert_eq!(read_lines(&dir.path().join("channel_7.dat")).len(), 3);
    }

    #[test]
    fn ingest_routes_every_sub_channel() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]);
        let telegram = decode_telegram(
            "<msg><sensor>2</sensor><id>31</id><ch1><watts>1</watts></ch1>\
             <ch3><watts>3</watts></ch3></msg>",
        )
        .unwrap();
        registry.ingest("/dev/ttyUSB0", &telegram).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(SensorKey::new(31, 1)).unwrap().last_value, Some(1));
        assert_eq!(registry.get(SensorKey::new(31, 3)).unwrap().last_value, Some(3));
        assert!(registry.get(SensorKey::new(31, 2)).is_none());
    }

    #[test]
    fn concurrent_updates_create_one_state_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let port = format!("/dev/ttyUSB{worker}");
                    for i in 0..50u64 {
                        let key = SensorKey::new((i % 5) as u32, 1);
                        registry
                            .update_at(key, 100, &port, 0, at(1_000_000 + i * 1_000))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.len(), 5);
        for id in 0..5 {
            let state = registry.get(SensorKey::new(id, 1)).unwrap();
            let heard: u64 = state.locations.values().sum();
            assert_eq!(heard, 40);
            // 10 segundos distintos por sensor, cada um gravado uma vez
            let lines = read_lines(&dir.path().join(format!("channel_{id}.dat")));
            assert!(lines.len() >= 10);
        }
    }

    #[test]
    fn blocked_append_does_not_stall_other_sensors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]));
        let slow = SensorKey::new(11, 1);

        // Segura a vez do arquivo do sensor 11: a gravação dele fica parada
        let queue = registry.writer.queue_for(&dir.path().join("channel_11.dat"));
        let held = queue.ticket();

        let blocked = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry.update_at(slow, 150, "/dev/ttyUSB0", 1, at(1_700_000_000_000))
            })
        };
        while registry.get(slow).is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let other = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let outcome = registry
                    .update_at(SensorKey::new(22, 1), 80, "/dev/ttyUSB1", 2, at(1_700_000_000_000))
                    .unwrap();
                let sensors = registry.snapshot().sensors.len();
                tx.send((outcome, sensors)).unwrap();
            })
        };
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            (UpdateOutcome::Written, 2)
        );
        other.join().unwrap();

        // O segundo já está reservado: um eco chega como duplicado
        assert_eq!(
            registry
                .update_at(slow, 151, "/dev/ttyUSB1", 3, at(1_700_000_000_300))
                .unwrap(),
            UpdateOutcome::Duplicate
        );
        assert!(read_lines(&dir.path().join("channel_11.dat")).is_empty());

        queue.run(held, || ());
        assert_eq!(blocked.join().unwrap().unwrap(), UpdateOutcome::Written);
        assert_eq!(
            read_lines(&dir.path().join("channel_11.dat")),
            vec!["1700000000 150 /dev/ttyUSB0 1"]
        );
    }

    #[test]
    fn failed_append_releases_the_second() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("saida");
        let registry = SensorRegistry::new(ReadingWriter::new(&out), vec![]);
        let key = SensorKey::new(11, 1);

        assert!(registry
            .update_at(key, 150, "/dev/ttyUSB0", 1, at(1_700_000_000_100))
            .is_err());
        assert_eq!(registry.get(key).unwrap().last_written, None);

        std::fs::create_dir(&out).unwrap();
        let retry = registry.update_at(key, 151, "/dev/ttyUSB1", 4, at(1_700_000_000_200));
        assert_eq!(retry.unwrap(), UpdateOutcome::Written);
        assert_eq!(
            read_lines(&out.join("channel_11.dat")),
            vec!["1700000000 151 /dev/ttyUSB1 4"]
        );
    }

    #[test]
    fn snapshot_is_a_copy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::new(ReadingWriter::new(dir.path()), vec![]);
        registry.register_device(
            "/dev/ttyUSB0",
            DeviceInfo {
                version: Some("CC128-v0.11".into()),
                days_since_birth: Some(89),
            },
        );
        registry
            .update_at(SensorKey::new(3, 1), 40, "/dev/ttyUSB0", 0, at(1_000))
            .unwrap();

        let snap = registry.snapshot();
        registry
            .update_at(SensorKey::new(3, 1), 41, "/dev/ttyUSB0", 0, at(9_000))
            .unwrap();

        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.devices[0].port, "/dev/ttyUSB0");
        assert_eq!(snap.sensors[0].last_value, Some(40));
        assert_eq!(registry.get(SensorKey::new(3, 1)).unwrap().last_value, Some(41));
    }
}
