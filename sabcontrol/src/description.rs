//! UPnP device description fetch and parsing.

use crate::errors::ControlError;
use crate::soap::find_descendant_with_suffix;
use std::time::Duration;
use tracing::trace;
use ureq::Agent;
use xmltree::Element;

const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DeviceDescription {
    /// `uuid:RINCON_...` as published in the UDN element.
    pub udn: String,
    /// Sonos-specific room name, absent on other vendors.
    pub room_name: Option<String>,
    pub friendly_name: String,
    pub model_name: String,
    pub manufacturer: String,
    /// Host part of the description location.
    pub ip: String,
}

impl DeviceDescription {
    pub fn is_sonos(&self) -> bool {
        self.manufacturer.contains("Sonos")
    }

    /// UDN without the `uuid:` prefix.
    pub fn uuid(&self) -> &str {
        self.udn.strip_prefix("uuid:").unwrap_or(&self.udn)
    }

    /// Room name when present, friendly name otherwise.
    pub fn display_name(&self) -> &str {
        self.room_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.friendly_name)
    }
}

/// Fetches and parses a device description document.
pub fn fetch_description(location: &str) -> Result<DeviceDescription, ControlError> {
    let config = Agent::config_builder()
        .timeout_global(Some(DESCRIPTION_TIMEOUT))
        .build();
    let agent: Agent = config.into();

    let mut response = agent
        .get(location)
        .call()
        .map_err(|e| ControlError::network("FetchDescription", e))?;

    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| ControlError::network("FetchDescription", e))?;

    let ip = host_from_location(location)
        .ok_or_else(|| ControlError::Parse(format!("no host in location: {}", location)))?;

    parse_description(&body, ip)
}

pub fn parse_description(xml: &str, ip: String) -> Result<DeviceDescription, ControlError> {
    let root = Element::parse(xml.as_bytes())
        .map_err(|e| ControlError::Parse(format!("device description: {}", e)))?;

    let device = find_descendant_with_suffix(&root, "device")
        .ok_or_else(|| ControlError::missing_field("device"))?;

    let text_of = |name: &str| -> Option<String> {
        find_descendant_with_suffix(device, name)
            .and_then(|e| e.get_text().map(|t| t.trim().to_string()))
            .filter(|t| !t.is_empty())
    };

    let udn = text_of("UDN").ok_or_else(|| ControlError::missing_field("UDN"))?;
    let friendly_name = text_of("friendlyName").unwrap_or_else(|| "Unknown".to_string());

    let description = DeviceDescription {
        udn,
        room_name: text_of("roomName"),
        friendly_name,
        model_name: text_of("modelName").unwrap_or_default(),
        manufacturer: text_of("manufacturer").unwrap_or_default(),
        ip,
    };

    trace!("Parsed description for {}", description.uuid());
    Ok(description)
}

/// `http://192.168.1.50:1400/xml/device_description.xml` → `192.168.1.50`
pub fn host_from_location(location: &str) -> Option<String> {
    let rest = location.split("://").nth(1)?;
    let host_port = rest.split('/').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
