//! Decodificador de telegramas XML do CurrentCost.
//!
//! Cada linha da serial é um registro XML completo:
//!
//! ```text
//! <msg><src>CC128-v0.11</src><dsb>00089</dsb><time>13:02:39</time>
//!   <tmpr>18.7</tmpr><sensor>1</sensor><id>01234</id><type>1</type>
//!   <ch1><watts>00345</watts></ch1></msg>
//! ```
//!
//! - Campos são endereçados pelo caminho relativo à raiz (`ch1/watts`).
//! - A forma achatada `<ch1/watts>345</ch1/watts>` endereça o mesmo caminho.
//! - Registros com `<hist>` são histogramas de diagnóstico → [`DecodeError::Ignorable`].
//!
//! O link serial é instável: linhas truncadas ou corrompidas viram
//! [`DecodeError::Malformed`], nunca panic. Política de retry fica na sessão.

use crate::types::DeviceInfo;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashMap;

/// Transmissores de CT clamp carregam no máximo 3 sensores.
pub const MAX_SUB_CHANNELS: u8 = 3;

/// Elemento que marca registros de histograma.
const HISTOGRAM_ELEMENT: &str = "hist";

/// Erros de decodificação.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("XML malformado: {0}")]
    Malformed(String),

    #[error("Registro de histograma (ignorado)")]
    Ignorable,

    #[error("Campo obrigatório ausente: <{name}>")]
    MissingField { name: String },

    #[error("Valor inválido em <{field}>: {value:?}")]
    InvalidNumber { field: String, value: String },
}

// ──────────────────────────────────────────────
// Payload genérico
// ──────────────────────────────────────────────

/// Conteúdo textual de um registro, indexado pelo caminho do elemento.
///
/// Elementos sem texto também aparecem (com string vazia).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    fields: HashMap<String, String>,
}

impl Payload {
    /// Texto do elemento em `path` (ex: `"ch2/watts"`).
    pub fn field(&self, path: &str) -> Option<&str> {
        self.fields.get(path).map(String::as_str)
    }

    /// Identificação do monitor (`<src>`/`<dsb>`), se presente.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        let version = self
            .field("src")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let days_since_birth = self.field("dsb").and_then(|s| s.trim().parse().ok());

        if version.is_none() && days_since_birth.is_none() {
            return None;
        }
        Some(DeviceInfo {
            version,
            days_since_birth,
        })
    }
}

/// Faz o parse de uma linha em [`Payload`].
pub fn parse_payload(line: &str) -> Result<Payload, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Malformed("linha vazia".into()));
    }

    let mut reader = Reader::from_str(line);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if path.is_empty() && saw_root {
                    return Err(DecodeError::Malformed("conteúdo após o elemento raiz".into()));
                }
                saw_root = true;
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                if path.len() > 1 {
                    fields.entry(path[1..].join("/")).or_default();
                }
            }
            Ok(Event::Empty(e)) => {
                if path.is_empty() {
                    if saw_root {
                        return Err(DecodeError::Malformed("conteúdo após o elemento raiz".into()));
                    }
                    saw_root = true;
                    continue;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut key = path[1..].join("/");
                if !key.is_empty() {
                    key.push('/');
                }
                key.push_str(&name);
                fields.entry(key).or_default();
            }
            Ok(Event::Text(t)) => {
                if path.is_empty() {
                    return Err(DecodeError::Malformed("texto fora do elemento raiz".into()));
                }
                if path.len() == 1 {
                    continue;
                }
                let text = t
                    .unescape()
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                fields.entry(path[1..].join("/")).or_default().push_str(&text);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {} // declaração, comentários, CDATA
            Err(e) => return Err(DecodeError::Malformed(e.to_string())),
        }
    }

    if let Some(open) = path.last() {
        return Err(DecodeError::Malformed(format!("registro truncado: <{open}> não fechado")));
    }
    if !saw_root {
        return Err(DecodeError::Malformed("nenhum elemento encontrado".into()));
    }
    if fields.contains_key(HISTOGRAM_ELEMENT) {
        return Err(DecodeError::Ignorable);
    }

    Ok(Payload { fields })
}

// ──────────────────────────────────────────────
// Telegrama de leitura
// ──────────────────────────────────────────────

/// Potência instantânea de um sub-canal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub sub_channel: u8,
    pub watts: i64,
}

/// Um telegrama de leitura já validado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Radio ID do transmissor (`<id>`)
    pub group_id: u32,
    /// Canal do transmissor neste monitor (`<sensor>`)
    pub local_channel: u32,
    /// 1..=3 leituras, ordenadas por sub-canal
    pub readings: Vec<Reading>,
}

impl Telegram {
    /// Extrai os campos obrigatórios de um payload.
    pub fn from_payload(payload: &Payload) -> Result<Self, DecodeError> {
        let group_id = required_number(payload, "id")?;
        let local_channel = required_number(payload, "sensor")?;

        let mut readings = Vec::new();
        for sub_channel in 1..=MAX_SUB_CHANNELS {
            let path = format!("ch{sub_channel}/watts");
            if let Some(raw) = payload.field(&path) {
                readings.push(Reading {
                    sub_channel,
                    watts: parse_number(&path, raw)?,
                });
            }
        }

        if readings.is_empty() {
            return Err(DecodeError::MissingField {
                name: "ch1/watts".into(),
            });
        }

        Ok(Self {
            group_id,
            local_channel,
            readings,
        })
    }
}

/// Decodifica uma linha diretamente em [`Telegram`].
pub fn decode_telegram(line: &str) -> Result<Telegram, DecodeError> {
    Telegram::from_payload(&parse_payload(line)?)
}

fn required_number<T: std::str::FromStr>(payload: &Payload, name: &str) -> Result<T, DecodeError> {
    let raw = payload.field(name).ok_or_else(|| DecodeError::MissingField {
        name: name.to_string(),
    })?;
    parse_number(name, raw)
}

fn parse_number<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, DecodeError> {
    raw.trim().parse().map_err(|_| DecodeError::InvalidNumber {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const CC128_LINE: &str = "<msg><src>CC128-v0.11</src><dsb>00089</dsb><time>13:02:39</time>\
        <tmpr>18.7</tmpr><sensor>1</sensor><id>01234</id><type>1</type>\
        <ch1><watts>00345</watts></ch1><ch2><watts>02151</watts></ch2></msg>";

    #[test]
    fn decodes_nested_cc128_record() {
        let t = decode_telegram(CC128_LINE).unwrap();
        assert_eq!(t.group_id, 1234);
        assert_eq!(t.local_channel, 1);
        assert_eq!(
            t.readings,
            vec![
                Reading { sub_channel: 1, watts: 345 },
                Reading { sub_channel: 2, watts: 2151 },
            ]
        );
    }

    #[test]
    fn decodes_flattened_channel_form() {
        let t = decode_telegram("<r><id>11</id><sensor>1</sensor><ch1/watts>150</ch1/watts></r>")
            .unwrap();
        assert_eq!(t.group_id, 11);
        assert_eq!(t.readings, vec![Reading { sub_channel: 1, watts: 150 }]);
    }

    #[test]
    fn extracts_device_info() {
        let info = parse_payload(CC128_LINE).unwrap().device_info().unwrap();
        assert_eq!(info.version.as_deref(), Some("CC128-v0.11"));
        assert_eq!(info.days_since_birth, Some(89));

        let bare = parse_payload("<msg><id>1</id></msg>").unwrap();
        assert!(bare.device_info().is_none());
    }

    #[test]
    fn histogram_is_ignorable() {
        let line = "<msg><src>CC128-v0.11</src><dsb>00089</dsb><hist><dsw>00032</dsw>\
            <type>1</type><units>kwhr</units><data><sensor>0</sensor><h024>001.1</h024>\
            </data></hist></msg>";
        assert_eq!(parse_payload(line), Err(DecodeError::Ignorable));
        assert_eq!(decode_telegram(line), Err(DecodeError::Ignorable));
    }

    #[test]
    fn truncated_line_is_malformed() {
        let truncated = &CC128_LINE[..CC128_LINE.len() - 20];
        assert!(matches!(
            decode_telegram(truncated),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_telegram("atts>00345</watts></ch1></msg>"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_never_panics() {
        for line in ["", "   ", "<", "</msg>", "<<>>", "<msg><id>1</msg>", "\u{fffd}\u{fffd}"] {
            assert!(decode_telegram(line).is_err(), "aceitou {line:?}");
        }
    }

    #[test]
    fn missing_fields_are_named() {
        assert_eq!(
            decode_telegram("<msg><sensor>1</sensor><ch1><watts>5</watts></ch1></msg>"),
            Err(DecodeError::MissingField { name: "id".into() })
        );
        assert_eq!(
            decode_telegram("<msg><id>7</id><ch1><watts>5</watts></ch1></msg>"),
            Err(DecodeError::MissingField { name: "sensor".into() })
        );
        assert_eq!(
            decode_telegram("<msg><id>7</id><sensor>0</sensor></msg>"),
            Err(DecodeError::MissingField { name: "ch1/watts".into() })
        );
    }

    #[test]
    fn non_numeric_watts_is_rejected() {
        assert_eq!(
            decode_telegram("<msg><id>7</id><sensor>0</sensor><ch1><watts>x1</watts></ch1></msg>"),
            Err(DecodeError::InvalidNumber {
                field: "ch1/watts".into(),
                value: "x1".into()
            })
        );
    }

    #[test]
    fn negative_watts_are_accepted() {
        let line = "<msg><id>7</id><sensor>0</sensor><ch3><watts>-12</watts></ch3></msg>";
        let t = decode_telegram(line).unwrap();
        assert_eq!(t.readings, vec![Reading { sub_channel: 3, watts: -12 }]);
    }
}
