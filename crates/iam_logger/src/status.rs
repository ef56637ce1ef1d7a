//! Tabela de status: um bloco por monitor com os sensores ouvidos nele.

use iam_core::registry::{RegistrySnapshot, SensorState};
use iam_core::stats::RunningStats;
use iam_core::types::DeviceStatus;
use std::fmt::Write as _;
use std::path::Path;

/// Renderiza o snapshot completo.
pub fn render(snapshot: &RegistrySnapshot) -> String {
    let mut out = String::new();

    for device in &snapshot.devices {
        render_device(&mut out, device, &snapshot.sensors);
    }

    let silent: Vec<&SensorState> = snapshot
        .sensors
        .iter()
        .filter(|s| s.locations.is_empty())
        .collect();
    if !silent.is_empty() {
        out.push_str("Sensores sem leitura válida:\n");
        for sensor in silent {
            let _ = writeln!(out, "  {} ({})", display_label(sensor), sensor.key);
        }
        out.push('\n');
    }

    out
}

fn render_device(out: &mut String, device: &DeviceStatus, sensors: &[SensorState]) {
    let dsb = device
        .info
        .days_since_birth
        .map_or_else(|| "-".to_string(), |d| d.to_string());
    let _ = writeln!(out, "port      = {}", device.port);
    let _ = writeln!(out, "DSB       = {dsb}");
    let _ = writeln!(
        out,
        "Version   = {}\n",
        device.info.version.as_deref().unwrap_or("-")
    );
    let _ = writeln!(out, "{}|---PERIOD STATS (secs)---|", " ".repeat(41));
    let _ = writeln!(
        out,
        "{:>20.20} {:>4} {:>6} {:>5} {:>7}{:>7}{:>7}{:>7}{:>7} {:>7} LOCATIONS",
        "LABEL", "CHAN", "CCsens", "WATTS", "MEAN", "MAX", "MIN", "LAST", "COUNT", "RADIOID"
    );

    // Sensores ouvidos neste monitor, ordenados pelo canal local
    let port = device.port.as_str();
    let mut rows: Vec<(u32, u8, &SensorState)> = sensors
        .iter()
        .flat_map(move |s| {
            s.locations
                .keys()
                .filter(move |loc| loc.port == port)
                .map(move |loc| (loc.local_channel, loc.sub_channel, s))
        })
        .collect();
    rows.sort_by_key(|&(local, sub, s)| (local, sub, s.key));

    for (local, sub, sensor) in rows {
        let _ = writeln!(
            out,
            "{:>20.20} {:>4} {:>4}/{:>1} {:>5} {} {:>7} {}",
            display_label(sensor),
            sensor.output_channel.as_deref().unwrap_or("-"),
            local,
            sub,
            sensor
                .last_value
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            format_stats(&sensor.stats),
            sensor.key.group_id,
            format_locations(sensor),
        );
    }
    out.push_str("\n\n");
}

fn display_label(sensor: &SensorState) -> String {
    if sensor.never_zero {
        format!("*{}", sensor.label)
    } else {
        sensor.label.clone()
    }
}

fn format_stats(stats: &RunningStats) -> String {
    match (stats.mean(), stats.max(), stats.min(), stats.last_interval()) {
        (Some(mean), Some(max), Some(min), Some(last)) => format!(
            "{mean:>7.2}{max:>7.1}{min:>7.1}{last:>7.1}{:>7}",
            stats.count()
        ),
        _ => format!("{:>7}{:>7}{:>7}{:>7}{:>7}", "-", "-", "-", "-", stats.count()),
    }
}

fn format_locations(sensor: &SensorState) -> String {
    sensor
        .locations
        .iter()
        .map(|(loc, n)| format!("{loc}: {n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Grava o status (modo headless). Substitui o arquivo inteiro.
pub fn write_stats_file(path: &Path, snapshot: &RegistrySnapshot) -> std::io::Result<()> {
    std::fs::write(path, render(snapshot))
}
