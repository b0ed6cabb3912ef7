//! GroupRenderingControl:1 client.
//!
//! Group volume commands must go to the group coordinator; members answer
//! with UPnP error 701.

use crate::errors::ControlError;
use crate::rendering_control::parse_bool_flag;
use crate::soap::{expect_response, extract_child_text, handle_action_response, invoke_with_retry};

const GROUP_RENDERING_SERVICE: &str = "urn:schemas-upnp-org:service:GroupRenderingControl:1";
const GROUP_RENDERING_CONTROL: &str = "/MediaRenderer/GroupRenderingControl/Control";

#[derive(Debug, Clone)]
pub struct GroupRenderingClient {
    pub control_url: String,
    pub service_type: String,
}

impl GroupRenderingClient {
    pub fn for_ip(ip: &str) -> Self {
        Self {
            control_url: format!("http://{}:1400{}", ip, GROUP_RENDERING_CONTROL),
            service_type: GROUP_RENDERING_SERVICE.to_string(),
        }
    }

    /// GroupRenderingControl:1 — GetGroupVolume
    pub fn get_group_volume(&self) -> Result<u16, ControlError> {
        let args = [("InstanceID", "0")];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "GetGroupVolume",
            &args,
        )?;
        let response = expect_response("GetGroupVolume", &result)?;

        let text = extract_child_text(response, "CurrentVolume")?;
        text.parse::<u16>()
            .map_err(|_| ControlError::bad_value("CurrentVolume", &text))
    }

    /// GroupRenderingControl:1 — SetGroupVolume
    pub fn set_group_volume(&self, volume: u16) -> Result<(), ControlError> {
        let volume_str = volume.min(100).to_string();
        let args = [
            ("InstanceID", "0"),
            ("DesiredVolume", volume_str.as_str()),
        ];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "SetGroupVolume",
            &args,
        )?;
        handle_action_response("SetGroupVolume", &result)
    }

    /// GroupRenderingControl:1 — SetRelativeGroupVolume. Returns the new
    /// group volume as reported by the coordinator.
    pub fn adjust_group_volume(&self, adjustment: i32) -> Result<u16, ControlError> {
        let adjustment_str = adjustment.to_string();
        let args = [
            ("InstanceID", "0"),
            ("Adjustment", adjustment_str.as_str()),
        ];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "SetRelativeGroupVolume",
            &args,
        )?;
        let response = expect_response("SetRelativeGroupVolume", &result)?;

        let text = extract_child_text(response, "NewVolume")?;
        text.parse::<u16>()
            .map_err(|_| ControlError::bad_value("NewVolume", &text))
    }

    /// GroupRenderingControl:1 — GetGroupMute
    pub fn get_group_mute(&self) -> Result<bool, ControlError> {
        let args = [("InstanceID", "0")];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "GetGroupMute",
            &args,
        )?;
        let response = expect_response("GetGroupMute", &result)?;

        let text = extract_child_text(response, "CurrentMute")?;
        parse_bool_flag("CurrentMute", &text)
    }

    /// GroupRenderingControl:1 — SetGroupMute
    pub fn set_group_mute(&self, mute: bool) -> Result<(), ControlError> {
        let mute_str = if mute { "1" } else { "0" };
        let args = [("InstanceID", "0"), ("DesiredMute", mute_str)];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "SetGroupMute",
            &args,
        )?;
        handle_action_response("SetGroupMute", &result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_url_shape() {
        let client = GroupRenderingClient::for_ip("192.168.1.60");
        assert_eq!(
            client.control_url,
            "http://192.168.1.60:1400/MediaRenderer/GroupRenderingControl/Control"
        );
        assert_eq!(client.service_type, GROUP_RENDERING_SERVICE);
    }
}
