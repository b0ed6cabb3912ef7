//! RenderingControl:1 client (per-device volume and mute).

use crate::errors::ControlError;
use crate::soap::{expect_response, extract_child_text, handle_action_response, invoke_with_retry};

const RENDERING_SERVICE: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
const RENDERING_CONTROL: &str = "/MediaRenderer/RenderingControl/Control";

const CHANNEL_MASTER: &str = "Master";

#[derive(Debug, Clone)]
pub struct RenderingControlClient {
    pub control_url: String,
    pub service_type: String,
}

impl RenderingControlClient {
    pub fn for_ip(ip: &str) -> Self {
        Self {
            control_url: format!("http://{}:1400{}", ip, RENDERING_CONTROL),
            service_type: RENDERING_SERVICE.to_string(),
        }
    }

    /// RenderingControl:1 — GetVolume
    pub fn get_volume(&self) -> Result<u16, ControlError> {
        let args = [("InstanceID", "0"), ("Channel", CHANNEL_MASTER)];
        let result =
            invoke_with_retry(&self.control_url, &self.service_type, "GetVolume", &args)?;
        let response = expect_response("GetVolume", &result)?;

        let text = extract_child_text(response, "CurrentVolume")?;
        text.parse::<u16>()
            .map_err(|_| ControlError::bad_value("CurrentVolume", &text))
    }

    /// RenderingControl:1 — SetVolume
    pub fn set_volume(&self, volume: u16) -> Result<(), ControlError> {
        let volume_str = volume.min(100).to_string();
        let args = [
            ("InstanceID", "0"),
            ("Channel", CHANNEL_MASTER),
            ("DesiredVolume", volume_str.as_str()),
        ];
        let result =
            invoke_with_retry(&self.control_url, &self.service_type, "SetVolume", &args)?;
        handle_action_response("SetVolume", &result)
    }

    /// RenderingControl:1 — GetMute
    pub fn get_mute(&self) -> Result<bool, ControlError> {
        let args = [("InstanceID", "0"), ("Channel", CHANNEL_MASTER)];
        let result = invoke_with_retry(&self.control_url, &self.service_type, "GetMute", &args)?;
        let response = expect_response("GetMute", &result)?;

        let text = extract_child_text(response, "CurrentMute")?;
        parse_bool_flag("CurrentMute", &text)
    }

    /// RenderingControl:1 — SetMute
    pub fn set_mute(&self, mute: bool) -> Result<(), ControlError> {
        let mute_str = if mute { "1" } else { "0" };
        let args = [
            ("InstanceID", "0"),
            ("Channel", CHANNEL_MASTER),
            ("DesiredMute", mute_str),
        ];
        let result = invoke_with_retry(&self.control_url, &self.service_type, "SetMute", &args)?;
        handle_action_response("SetMute", &result)
    }
}

pub(crate) fn parse_bool_flag(name: &str, text: &str) -> Result<bool, ControlError> {
    match text {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ControlError::bad_value(name, text)),
    }
}
