//! Pod NAT annotation parsing and validation

use crate::error::{Error, Result};
use crate::types::{NatDefinition, PodNatAnnotation};

/// Parse the nested JSON annotation and validate every entry.
///
/// Defaults applied before overriding with parsed fields: interface
/// auto-detection on, protocol tcp, no explicit source IP. A failed
/// parse skips the pod, it never tears down the controller.
pub fn parse_annotation(
    data: &str,
    restricted_ports: &[u16],
    restricted_ports_enable: bool,
) -> Result<PodNatAnnotation> {
    let parsed: PodNatAnnotation = serde_json::from_str(data)
        .map_err(|e| Error::Validation(format!("error decoding annotation '{}': {}", data, e)))?;

    for entry in &parsed.entries {
        validate_entry(entry, restricted_ports, restricted_ports_enable)?;
    }

    Ok(parsed)
}

fn validate_entry(
    entry: &NatDefinition,
    restricted_ports: &[u16],
    restricted_ports_enable: bool,
) -> Result<()> {
    if entry.source_port == 0 || entry.destination_port == 0 {
        return Err(Error::Validation(
            "port 0 is reserved and cannot be used".to_string(),
        ));
    }

    // exactly one of srcIP / ifaceAuto must be in effect
    if entry.source_ip.is_some() && entry.interface_auto_detect {
        return Err(Error::Validation(
            "entry sets both an explicit source IP and interface auto-detection".to_string(),
        ));
    }
    if entry.source_ip.is_none() && !entry.interface_auto_detect {
        return Err(Error::Validation(
            "entry needs either an explicit source IP or interface auto-detection".to_string(),
        ));
    }

    if !restricted_ports_enable {
        for port in [entry.source_port, entry.destination_port] {
            if restricted_ports.contains(&port) {
                return Err(Error::Validation(format!(
                    "port {} is restricted and refused for NAT rules",
                    port
                )));
            }
        }
    }

    Ok(())
}
