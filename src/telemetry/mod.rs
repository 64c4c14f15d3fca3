//! Periodic system telemetry production on the drone.
//!
//! Every cycle collects CPU stats, the current transport, and (when the
//! link rides a cellular modem) the modem signal record, then ships the
//! result as a `SysTelemetry` packet.

pub mod cpu;
pub mod modem;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::link::packet::{PhySignal, PhyType, SysTelemetry};
use crate::link::LinkSender;
use cpu::CpuSampler;
use modem::{ModemProbe, RadioType, SignalInfo};
use transport::{TransportDetector, TransportMethod};

pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Build the telemetry packet for one cycle. Pure given its inputs.
pub fn build_telemetry(
    cpu: cpu::CpuInfo,
    method: TransportMethod,
    signal: Option<SignalInfo>,
) -> SysTelemetry {
    let mut telemetry = SysTelemetry::basic(cpu.temperature_celsius, cpu.usage_percent);

    match method {
        TransportMethod::Cellular => match signal {
            Some(s) if s.radio == RadioType::Lte => {
                telemetry.phy_type = PhyType::Lte;
                telemetry.signal = PhySignal::Lte {
                    rssi: s.rssi.unwrap_or(0),
                    rsrq: s.rsrq.unwrap_or(0),
                    rsrp: s.rsrp.unwrap_or(0),
                    snr: s.snr.unwrap_or(0.0),
                };
            }
            Some(s) if s.radio == RadioType::Wcdma => {
                telemetry.phy_type = PhyType::Wcdma;
                telemetry.signal = PhySignal::Wcdma {
                    rssi: s.rssi.unwrap_or(0),
                };
            }
            _ => telemetry.phy_type = PhyType::Unknown,
        },
        TransportMethod::Wifi => telemetry.phy_type = PhyType::Wifi,
        TransportMethod::Ethernet => telemetry.phy_type = PhyType::Ethernet,
        TransportMethod::Unknown => telemetry.phy_type = PhyType::Unknown,
    }

    telemetry
}

/// Spawn the producer task. It stops within one interval once `running`
/// clears.
pub fn spawn_producer(
    sender: LinkSender,
    probe: Arc<dyn ModemProbe>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = CpuSampler::new();
        let mut detector = TransportDetector::default();
        info!(interval = ?TELEMETRY_INTERVAL, "telemetry producer started");

        while running.load(Ordering::Acquire) {
            let cpu = sampler.sample();
            let method = detector.current();
            let signal = if method == TransportMethod::Cellular {
                match probe.signal_info() {
                    Ok(s) => Some(s),
                    Err(e) => {
                        debug!(error = %e, "modem probe failed");
                        None
                    }
                }
            } else {
                None
            };

            let telemetry = build_telemetry(cpu, method, signal);
            if let Err(e) = sender.send_sys_telemetry(telemetry) {
                warn!(error = %e, "failed to send telemetry");
            }

            tokio::time::sleep(TELEMETRY_INTERVAL).await;
        }
        info!("telemetry producer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_info() -> cpu::CpuInfo {
        cpu::CpuInfo {
            temperature_celsius: 52.0,
            usage_percent: 33.0,
        }
    }

    #[test]
    fn test_lte_signal_tagged() {
        let signal = SignalInfo {
            radio: RadioType::Lte,
            rssi: Some(-70),
            rsrq: Some(-11),
            rsrp: Some(-99),
            snr: Some(9.5),
            ecio: None,
        };
        let t = build_telemetry(cpu_info(), TransportMethod::Cellular, Some(signal));
        assert_eq!(t.phy_type, PhyType::Lte);
        assert_eq!(
            t.signal,
            PhySignal::Lte {
                rssi: -70,
                rsrq: -11,
                rsrp: -99,
                snr: 9.5
            }
        );
    }

    #[test]
    fn test_wcdma_signal_tagged() {
        let signal = SignalInfo {
            radio: RadioType::Wcdma,
            rssi: Some(-85),
            ..Default::default()
        };
        let t = build_telemetry(cpu_info(), TransportMethod::Cellular, Some(signal));
        assert_eq!(t.phy_type, PhyType::Wcdma);
        assert_eq!(t.signal, PhySignal::Wcdma { rssi: -85 });
    }

    #[test]
    fn test_wifi_has_no_signal_record() {
        let t = build_telemetry(cpu_info(), TransportMethod::Wifi, None);
        assert_eq!(t.phy_type, PhyType::Wifi);
        assert_eq!(t.signal, PhySignal::None);
        assert_eq!(t.cpu_temp_c, 52.0);
        assert_eq!(t.cpu_usage_pct, 33.0);
    }

    #[test]
    fn test_cellular_without_probe_is_unknown() {
        let t = build_telemetry(cpu_info(), TransportMethod::Cellular, None);
        assert_eq!(t.phy_type, PhyType::Unknown);
    }
}
