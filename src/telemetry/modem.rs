//! Cellular modem signal probing through the external `uqmi` tool.
//!
//! `uqmi` occasionally emits diagnostics around the JSON payload or
//! non-strict JSON; parsing therefore sanitizes the output to the first
//! `{…}` block, tries strict JSON first, and falls back to a tolerant
//! key scan when that fails.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ModemError {
    #[error("failed to run {tool}: {source}")]
    Exec {
        tool: String,
        source: std::io::Error,
    },

    #[error("no signal information in modem output")]
    NoSignal,
}

/// Radio access type reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioType {
    Lte,
    Wcdma,
    Gsm,
    #[default]
    Unknown,
}

impl RadioType {
    fn from_str(s: &str) -> Self {
        match s {
            "lte" => RadioType::Lte,
            "wcdma" => RadioType::Wcdma,
            "gsm" => RadioType::Gsm,
            _ => RadioType::Unknown,
        }
    }
}

/// Signal record from `--get-signal-info`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalInfo {
    pub radio: RadioType,
    pub rssi: Option<i32>,
    pub ecio: Option<i32>,
    pub rsrq: Option<i32>,
    pub rsrp: Option<i32>,
    pub snr: Option<f32>,
}

/// Seam for the external modem tool; tests inject canned outputs.
pub trait ModemProbe: Send + Sync {
    fn signal_info(&self) -> Result<SignalInfo, ModemError>;
}

/// Real probe shelling out to uqmi.
pub struct UqmiProbe {
    device: String,
}

impl UqmiProbe {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl Default for UqmiProbe {
    fn default() -> Self {
        let device = std::env::var("LTE_MODEM_DEVICE").unwrap_or_else(|_| "/dev/cdc-wdm0".into());
        Self::new(device)
    }
}

impl ModemProbe for UqmiProbe {
    fn signal_info(&self) -> Result<SignalInfo, ModemError> {
        let output = std::process::Command::new("uqmi")
            .args(["-d", &self.device, "--get-signal-info", "--timeout", "1000"])
            .output()
            .map_err(|source| ModemError::Exec {
                tool: "uqmi".into(),
                source,
            })?;
        // uqmi sometimes prints valid JSON while exiting non-zero.
        if !output.status.success() {
            debug!(status = %output.status, "uqmi exited non-zero, parsing anyway");
        }
        parse_signal_info(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Cut the output down to its first balanced-looking `{…}` block.
pub fn sanitize_payload(text: &str) -> &str {
    let Some(start) = text.find('{') else {
        return text;
    };
    let Some(end) = text.rfind('}') else {
        return text;
    };
    if end < start {
        return text;
    }
    &text[start..=end]
}

/// Strict parse first, tolerant key scan second.
pub fn parse_signal_info(raw: &str) -> Result<SignalInfo, ModemError> {
    let text = sanitize_payload(raw);

    if let Ok(root) = serde_json::from_str::<Value>(text) {
        if let Some(info) = signal_from_json(&root) {
            return Ok(info);
        }
    } else {
        warn!("strict JSON parse of modem output failed, using fallback scanner");
    }

    let info = fallback_scan(text);
    if info == SignalInfo::default() {
        return Err(ModemError::NoSignal);
    }
    Ok(info)
}

fn signal_from_json(root: &Value) -> Option<SignalInfo> {
    let obj = root.as_object()?;
    let mut info = SignalInfo::default();

    if let Some(t) = obj.get("type").and_then(Value::as_str) {
        info.radio = RadioType::from_str(t);
    }
    info.rssi = number_as_i32(obj.get("rssi"));
    info.ecio = number_as_i32(obj.get("ecio"));
    info.rsrq = number_as_i32(obj.get("rsrq"));
    info.rsrp = number_as_i32(obj.get("rsrp"));
    info.snr = obj.get("snr").and_then(Value::as_f64).map(|v| v as f32);

    // GSM reports "signal"; map it onto rssi when rssi is absent.
    if info.rssi.is_none() {
        info.rssi = number_as_i32(obj.get("signal"));
    }

    if info.radio == RadioType::Unknown && info.rssi.is_none() {
        return None;
    }
    Some(info)
}

/// Integers, or doubles rounded to nearest.
fn number_as_i32(value: Option<&Value>) -> Option<i32> {
    match value? {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i as i32)
            } else {
                n.as_f64().map(|d| d.round() as i32)
            }
        }
        _ => None,
    }
}

/// Tolerant scan for `"key": value` pairs in non-strict output.
fn fallback_scan(text: &str) -> SignalInfo {
    let mut info = SignalInfo::default();

    if let Some(t) = scan_string(text, "type") {
        info.radio = RadioType::from_str(&t);
    }
    info.rssi = scan_number(text, "rssi").map(|v| v as i32);
    info.ecio = scan_number(text, "ecio").map(|v| v as i32);
    info.rsrq = scan_number(text, "rsrq").map(|v| v as i32);
    info.rsrp = scan_number(text, "rsrp").map(|v| v as i32);
    info.snr = scan_number(text, "snr").map(|v| v as f32);
    if info.rssi.is_none() {
        info.rssi = scan_number(text, "signal").map(|v| v as i32);
    }
    info
}

fn value_start<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\"");
    let after_key = &text[text.find(&needle)? + needle.len()..];
    let after_colon = &after_key[after_key.find(':')? + 1..];
    Some(after_colon.trim_start())
}

fn scan_number(text: &str, key: &str) -> Option<f64> {
    let rest = value_start(text, key)?;
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+' || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn scan_string(text: &str, key: &str) -> Option<String> {
    let rest = value_start(text, key)?;
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT_LTE: &str = r#"{
        "type": "lte",
        "rssi": -68,
        "rsrq": -10,
        "rsrp": -97,
        "snr": 12.4
    }"#;

    #[test]
    fn test_strict_lte() {
        let info = parse_signal_info(STRICT_LTE).unwrap();
        assert_eq!(info.radio, RadioType::Lte);
        assert_eq!(info.rssi, Some(-68));
        assert_eq!(info.rsrq, Some(-10));
        assert_eq!(info.rsrp, Some(-97));
        assert_eq!(info.snr, Some(12.4));
    }

    #[test]
    fn test_noise_around_json_is_sanitized() {
        let noisy = format!("uqmi: setting up\n{STRICT_LTE}\ntrailing diagnostics");
        let info = parse_signal_info(&noisy).unwrap();
        assert_eq!(info.radio, RadioType::Lte);
        assert_eq!(info.rssi, Some(-68));
    }

    #[test]
    fn test_tolerant_fallback_on_nonstrict_json() {
        // Trailing comma makes this invalid for a strict parser; the
        // fallback scanner must still extract the fields.
        let sloppy = r#"{
            "type": "wcdma",
            "rssi": -81,
            "ecio": -6,
        }"#;
        let info = parse_signal_info(sloppy).unwrap();
        assert_eq!(info.radio, RadioType::Wcdma);
        assert_eq!(info.rssi, Some(-81));
        assert_eq!(info.ecio, Some(-6));
    }

    #[test]
    fn test_gsm_signal_maps_to_rssi() {
        let gsm = r#"{"type": "gsm", "signal": -73}"#;
        let info = parse_signal_info(gsm).unwrap();
        assert_eq!(info.radio, RadioType::Gsm);
        assert_eq!(info.rssi, Some(-73));
    }

    #[test]
    fn test_double_rssi_rounded() {
        let lte = r#"{"type": "lte", "rssi": -68.7}"#;
        let info = parse_signal_info(lte).unwrap();
        assert_eq!(info.rssi, Some(-69));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_signal_info("no json here at all").is_err());
        assert!(parse_signal_info("{}").is_err());
    }
}
