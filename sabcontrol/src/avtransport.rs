//! AVTransport:1 client.

use crate::errors::ControlError;
use crate::soap::{
    expect_response, extract_child_text, extract_child_text_or_empty, handle_action_response,
    invoke_with_retry,
};
use sabutils::{format_hms, parse_hms};
use xmltree::Element;

const AVTRANSPORT_SERVICE: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const AVTRANSPORT_CONTROL: &str = "/MediaRenderer/AVTransport/Control";

#[derive(Debug, Clone)]
pub struct AvTransportClient {
    pub control_url: String,
    pub service_type: String,
}

#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub transport_state: String,
    pub transport_status: String,
    pub speed: String,
}

impl TransportInfo {
    pub fn is_playing(&self) -> bool {
        self.transport_state == "PLAYING"
    }
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    /// Seconds into the current track; `None` while no track is loaded
    /// (renderers report `NOT_IMPLEMENTED`).
    pub rel_time_sec: Option<u64>,
    pub track_duration_sec: Option<u64>,
    pub track_uri: String,
}

impl AvTransportClient {
    pub fn for_ip(ip: &str) -> Self {
        Self {
            control_url: format!("http://{}:1400{}", ip, AVTRANSPORT_CONTROL),
            service_type: AVTRANSPORT_SERVICE.to_string(),
        }
    }

    /// AVTransport:1 — SetAVTransportURI
    ///
    /// `InstanceID` is pinned to 0; ZonePlayers expose a single transport
    /// instance.
    pub fn set_av_transport_uri(&self, uri: &str, metadata: &str) -> Result<(), ControlError> {
        let args = [
            ("InstanceID", "0"),
            ("CurrentURI", uri),
            ("CurrentURIMetaData", metadata),
        ];

        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "SetAVTransportURI",
            &args,
        )?;
        handle_action_response("SetAVTransportURI", &result)
    }

    /// AVTransport:1 — Play
    pub fn play(&self) -> Result<(), ControlError> {
        let args = [("InstanceID", "0"), ("Speed", "1")];
        let result = invoke_with_retry(&self.control_url, &self.service_type, "Play", &args)?;
        handle_action_response("Play", &result)
    }

    /// AVTransport:1 — Pause
    pub fn pause(&self) -> Result<(), ControlError> {
        let args = [("InstanceID", "0")];
        let result = invoke_with_retry(&self.control_url, &self.service_type, "Pause", &args)?;
        handle_action_response("Pause", &result)
    }

    /// AVTransport:1 — Stop
    pub fn stop(&self) -> Result<(), ControlError> {
        let args = [("InstanceID", "0")];
        let result = invoke_with_retry(&self.control_url, &self.service_type, "Stop", &args)?;
        handle_action_response("Stop", &result)
    }

    /// AVTransport:1 — Seek with a REL_TIME target.
    pub fn seek(&self, position_sec: u64) -> Result<(), ControlError> {
        let target = format_hms(position_sec);
        let args = [
            ("InstanceID", "0"),
            ("Unit", "REL_TIME"),
            ("Target", target.as_str()),
        ];
        let result = invoke_with_retry(&self.control_url, &self.service_type, "Seek", &args)?;
        handle_action_response("Seek", &result)
    }

    /// AVTransport:1 — GetTransportInfo
    pub fn get_transport_info(&self) -> Result<TransportInfo, ControlError> {
        let args = [("InstanceID", "0")];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "GetTransportInfo",
            &args,
        )?;
        let response = expect_response("GetTransportInfo", &result)?;
        parse_transport_info(response)
    }

    /// AVTransport:1 — GetPositionInfo
    pub fn get_position_info(&self) -> Result<PositionInfo, ControlError> {
        let args = [("InstanceID", "0")];
        let result = invoke_with_retry(
            &self.control_url,
            &self.service_type,
            "GetPositionInfo",
            &args,
        )?;
        let response = expect_response("GetPositionInfo", &result)?;
        parse_position_info(response)
    }
}

fn parse_transport_info(response: &Element) -> Result<TransportInfo, ControlError> {
    Ok(TransportInfo {
        transport_state: extract_child_text(response, "CurrentTransportState")?,
        transport_status: extract_child_text(response, "CurrentTransportStatus")?,
        speed: extract_child_text_or_empty(response, "CurrentSpeed"),
    })
}

fn parse_position_info(response: &Element) -> Result<PositionInfo, ControlError> {
    let rel_time = extract_child_text_or_empty(response, "RelTime");
    let duration = extract_child_text_or_empty(response, "TrackDuration");

    Ok(PositionInfo {
        rel_time_sec: parse_hms(&rel_time).ok(),
        track_duration_sec: parse_hms(&duration).ok(),
        track_uri: extract_child_text_or_empty(response, "TrackURI"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::find_child_with_suffix;

    fn response_element(xml: &str, action: &str) -> Element {
        let envelope = Element::parse(xml.as_bytes()).unwrap();
        let body = find_child_with_suffix(&envelope, "Body").unwrap();
        find_child_with_suffix(body, &format!("{}Response", action))
            .unwrap()
            .clone()
    }

    #[test]
    fn parse_transport_info_extracts_fields() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
          <s:Body>
            <u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
              <CurrentTransportState>PLAYING</CurrentTransportState>
              <CurrentTransportStatus>OK</CurrentTransportStatus>
              <CurrentSpeed>1</CurrentSpeed>
            </u:GetTransportInfoResponse>
          </s:Body></s:Envelope>"#;

        let info = parse_transport_info(&response_element(xml, "GetTransportInfo")).unwrap();
        assert!(info.is_playing());
        assert_eq!(info.transport_status, "OK");
        assert_eq!(info.speed, "1");
    }

    #[test]
    fn stopped_state_is_not_playing() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
          <s:Body>
            <u:GetTransportInfoResponse xmlns:u="urn:x">
              <CurrentTransportState>PAUSED_PLAYBACK</CurrentTransportState>
              <CurrentTransportStatus>OK</CurrentTransportStatus>
              <CurrentSpeed>1</CurrentSpeed>
            </u:GetTransportInfoResponse>
          </s:Body></s:Envelope>"#;

        let info = parse_transport_info(&response_element(xml, "GetTransportInfo")).unwrap();
        assert!(!info.is_playing());
    }

    #[test]
    fn parse_position_info_converts_times() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
          <s:Body>
            <u:GetPositionInfoResponse xmlns:u="urn:x">
              <Track>1</Track>
              <TrackDuration>2:00:00</TrackDuration>
              <TrackURI>http://bridge/stream/t/segment_000.m4a</TrackURI>
              <RelTime>1:59:56</RelTime>
              <AbsTime>NOT_IMPLEMENTED</AbsTime>
            </u:GetPositionInfoResponse>
          </s:Body></s:Envelope>"#;

        let info = parse_position_info(&response_element(xml, "GetPositionInfo")).unwrap();
        assert_eq!(info.rel_time_sec, Some(7196));
        assert_eq!(info.track_duration_sec, Some(7200));
        assert!(info.track_uri.ends_with("segment_000.m4a"));
    }

    #[test]
    fn not_implemented_times_become_none() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
          <s:Body>
            <u:GetPositionInfoResponse xmlns:u="urn:x">
              <TrackDuration>NOT_IMPLEMENTED</TrackDuration>
              <RelTime>NOT_IMPLEMENTED</RelTime>
            </u:GetPositionInfoResponse>
          </s:Body></s:Envelope>"#;

        let info = parse_position_info(&response_element(xml, "GetPositionInfo")).unwrap();
        assert_eq!(info.rel_time_sec, None);
        assert_eq!(info.track_duration_sec, None);
    }
}
