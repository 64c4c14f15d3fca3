//! Detection of the physical transport carrying the link, from the state
//! of the known network interfaces.

use std::process::Command;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMethod {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

/// Classify from `ip link show` output: the first matching interface that
/// is UP wins, in Wi-Fi → cellular → USB-ethernet order.
pub fn classify_ip_link(output: &str) -> TransportMethod {
    let mut has_wlan = false;
    let mut has_wwan = false;
    let mut has_usb = false;

    for line in output.lines() {
        let up = line.contains("UP");
        if line.contains("wlan0:") && up {
            has_wlan = true;
        } else if line.contains("wwan0:") && up {
            has_wwan = true;
        } else if line.contains("usb0:") && up {
            has_usb = true;
        }
    }

    if has_wlan {
        TransportMethod::Wifi
    } else if has_wwan {
        TransportMethod::Cellular
    } else if has_usb {
        TransportMethod::Ethernet
    } else {
        TransportMethod::Unknown
    }
}

/// Probe once and cache; the transport does not change mid-flight.
#[derive(Default)]
pub struct TransportDetector {
    cached: Option<TransportMethod>,
}

impl TransportDetector {
    pub fn current(&mut self) -> TransportMethod {
        if let Some(method) = self.cached {
            return method;
        }
        let method = detect();
        if method != TransportMethod::Unknown {
            self.cached = Some(method);
        }
        method
    }
}

fn detect() -> TransportMethod {
    match Command::new("ip").args(["link", "show"]).output() {
        Ok(output) => classify_ip_link(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!(error = %e, "ip link probe failed");
            TransportMethod::Unknown
        }
    }
}
