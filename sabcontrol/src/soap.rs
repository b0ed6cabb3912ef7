//! SOAP plumbing shared by the per-service clients.
//!
//! Requests are single-connection HTTP POSTs with the mandatory
//! `SOAPACTION` header; responses are parsed with xmltree and picked apart
//! by local-name suffix, because renderers disagree on namespace prefixes
//! but the tag subset we read is small and stable.

use crate::errors::ControlError;
use std::time::Duration;
use ureq::Agent;
use xmltree::{Element, XMLNode};

const SOAP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Result of a SOAP call: HTTP status, raw XML body, parsed envelope when
/// the body was well-formed.
pub struct SoapCallResult {
    pub status: ureq::http::StatusCode,
    pub raw_body: String,
    pub envelope: Option<Element>,
}

/// Builds the request envelope for a UPnP action.
pub fn build_soap_request(
    service_type: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<String, ControlError> {
    let mut action_elem = Element::new(&format!("u:{}", action));
    action_elem
        .attributes
        .insert("xmlns:u".to_string(), service_type.to_string());

    for (name, value) in args {
        let mut child = Element::new(name);
        child.children.push(XMLNode::Text((*value).to_string()));
        action_elem.children.push(XMLNode::Element(child));
    }

    let mut body = Element::new("s:Body");
    body.children.push(XMLNode::Element(action_elem));

    let mut envelope = Element::new("s:Envelope");
    envelope.attributes.insert(
        "xmlns:s".to_string(),
        "http://schemas.xmlsoap.org/soap/envelope/".to_string(),
    );
    envelope.attributes.insert(
        "s:encodingStyle".to_string(),
        "http://schemas.xmlsoap.org/soap/encoding/".to_string(),
    );
    envelope.children.push(XMLNode::Element(body));

    let mut buf = Vec::new();
    envelope
        .write(&mut buf)
        .map_err(|e| ControlError::Parse(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| ControlError::Parse(e.to_string()))
}

/// One SOAP POST, no retry. Transport failures map to
/// [`ControlError::Network`].
pub fn invoke_upnp_action(
    control_url: &str,
    service_type: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<SoapCallResult, ControlError> {
    let body_xml = build_soap_request(service_type, action, args)?;

    // 4xx/5xx carry the SOAP fault we want to read, so they are not errors
    // at the HTTP layer.
    let config = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(SOAP_TIMEOUT))
        .build();
    let agent: Agent = config.into();

    let soap_action_header = format!(r#""{}#{}""#, service_type, action);

    let mut response = agent
        .post(control_url)
        .header("Content-Type", r#"text/xml; charset="utf-8""#)
        .header("SOAPACTION", &soap_action_header)
        .send(body_xml)
        .map_err(|e| ControlError::network(action, e))?;

    let status = response.status();
    let raw_body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| ControlError::network(action, e))?;

    let envelope = Element::parse(raw_body.as_bytes()).ok();

    Ok(SoapCallResult {
        status,
        raw_body,
        envelope,
    })
}

/// SOAP POST with the standard retry policy: up to 3 attempts, exponential
/// backoff 500 ms / 1 s / 2 s, network-class errors only. A SOAP fault is
/// an answer from the device and is returned on the first attempt.
pub fn invoke_with_retry(
    control_url: &str,
    service_type: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<SoapCallResult, ControlError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match invoke_upnp_action(control_url, service_type, action, args) {
            Ok(result) => return Ok(result),
            Err(e) if attempt < MAX_ATTEMPTS && e.is_network_error() => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tracing::warn!(
                    "{} attempt {}/{} failed, retrying in {:?}: {}",
                    action,
                    attempt,
                    MAX_ATTEMPTS,
                    delay,
                    e
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Checks an action response for HTTP and UPnP-level failures.
pub fn handle_action_response(
    action: &str,
    call_result: &SoapCallResult,
) -> Result<(), ControlError> {
    if let Some(envelope) = &call_result.envelope {
        if let Some((code, description)) = parse_upnp_error(envelope) {
            return Err(ControlError::Upnp {
                action: action.to_string(),
                code,
                description,
            });
        }
    }

    if !call_result.status.is_success() {
        return Err(ControlError::HttpStatus {
            action: action.to_string(),
            status: call_result.status.as_u16(),
        });
    }

    Ok(())
}

/// Returns the `<ActionResponse>` element of a successful call.
pub fn expect_response<'a>(
    action: &str,
    call_result: &'a SoapCallResult,
) -> Result<&'a Element, ControlError> {
    handle_action_response(action, call_result)?;

    let envelope = call_result
        .envelope
        .as_ref()
        .ok_or_else(|| ControlError::Parse(format!("{}: unparseable SOAP body", action)))?;

    let body = find_child_with_suffix(envelope, "Body")
        .ok_or_else(|| ControlError::missing_field("Body"))?;

    let response_name = format!("{}Response", action);
    find_child_with_suffix(body, &response_name)
        .ok_or_else(|| ControlError::missing_field(&response_name))
}

/// Extracts `(errorCode, errorDescription)` from a SOAP fault, if present.
///
/// ```xml
/// <s:Body><s:Fault>
///   <detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
///     <errorCode>701</errorCode>
///     <errorDescription>Transition not available</errorDescription>
///   </UPnPError></detail>
/// </s:Fault></s:Body>
/// ```
pub fn parse_upnp_error(envelope: &Element) -> Option<(u32, String)> {
    let body = find_child_with_suffix(envelope, "Body")?;
    let fault = find_child_with_suffix(body, "Fault")?;
    let detail = find_child_with_suffix(fault, "detail")?;
    let upnp_error = find_child_with_suffix(detail, "UPnPError")?;

    let code_elem = find_child_with_suffix(upnp_error, "errorCode")?;
    let binding = code_elem.get_text()?;
    let code = binding.trim().parse::<u32>().ok()?;

    let description = find_child_with_suffix(upnp_error, "errorDescription")
        .and_then(|e| e.get_text().map(|t| t.trim().to_string()))
        .unwrap_or_default();

    Some((code, description))
}

pub fn find_child_with_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    parent.children.iter().find_map(|node| match node {
        XMLNode::Element(elem) if elem.name.ends_with(suffix) => Some(elem),
        _ => None,
    })
}

/// Depth-first search by local-name suffix.
pub fn find_descendant_with_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    for node in &parent.children {
        if let XMLNode::Element(elem) = node {
            if elem.name.ends_with(suffix) {
                return Some(elem);
            }
            if let Some(found) = find_descendant_with_suffix(elem, suffix) {
                return Some(found);
            }
        }
    }
    None
}

pub fn extract_child_text(parent: &Element, suffix: &str) -> Result<String, ControlError> {
    let child = find_child_with_suffix(parent, suffix)
        .ok_or_else(|| ControlError::missing_field(suffix))?;

    let text = child
        .get_text()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ControlError::missing_field(suffix))?;

    Ok(text)
}

/// Like [`extract_child_text`] but maps an absent or empty element to an
/// empty string (AVTransport leaves several fields blank while stopped).
pub fn extract_child_text_or_empty(parent: &Element, suffix: &str) -> String {
    find_child_with_suffix(parent, suffix)
        .and_then(|e| e.get_text().map(|t| t.trim().to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_wraps_action_and_args() {
        let xml = build_soap_request(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "Seek",
            &[("InstanceID", "0"), ("Unit", "REL_TIME"), ("Target", "0:02:05")],
        )
        .unwrap();

        assert!(xml.contains("u:Seek"));
        assert!(xml.contains(r#"xmlns:u="urn:schemas-upnp-org:service:AVTransport:1""#));
        assert!(xml.contains("<Target>0:02:05</Target>"));
        assert!(xml.contains("s:Envelope"));
    }

    #[test]
    fn build_request_escapes_argument_values() {
        let xml = build_soap_request(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "SetAVTransportURI",
            &[("CurrentURI", "http://h/stream?a=1&b=2")],
        )
        .unwrap();

        assert!(xml.contains("http://h/stream?a=1&amp;b=2"));
    }

    #[test]
    fn parse_fault_with_upnp_error() {
        let xml = r#"<?xml version="1.0"?>
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body>
                <s:Fault>
                  <faultcode>s:Client</faultcode>
                  <faultstring>UPnPError</faultstring>
                  <detail>
                    <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
                      <errorCode>701</errorCode>
                      <errorDescription>Transition not available</errorDescription>
                    </UPnPError>
                  </detail>
                </s:Fault>
              </s:Body>
            </s:Envelope>"#;

        let envelope = Element::parse(xml.as_bytes()).unwrap();
        let (code, description) = parse_upnp_error(&envelope).unwrap();
        assert_eq!(code, 701);
        assert_eq!(description, "Transition not available");
    }

    #[test]
    fn fault_becomes_typed_error() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body><s:Fault><detail>
                <UPnPError><errorCode>701</errorCode></UPnPError>
              </detail></s:Fault></s:Body></s:Envelope>"#;

        let result = SoapCallResult {
            status: ureq::http::StatusCode::INTERNAL_SERVER_ERROR,
            raw_body: xml.to_string(),
            envelope: Element::parse(xml.as_bytes()).ok(),
        };

        let err = handle_action_response("Pause", &result).unwrap_err();
        assert!(err.is_transition_unavailable());
    }

    #[test]
    fn expect_response_finds_action_element() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body>
                <u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
                  <CurrentVolume>23</CurrentVolume>
                </u:GetVolumeResponse>
              </s:Body></s:Envelope>"#;

        let result = SoapCallResult {
            status: ureq::http::StatusCode::OK,
            raw_body: xml.to_string(),
            envelope: Element::parse(xml.as_bytes()).ok(),
        };

        let response = expect_response("GetVolume", &result).unwrap();
        assert_eq!(extract_child_text(response, "CurrentVolume").unwrap(), "23");
    }

    #[test]
    fn missing_element_reported() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body><u:StopResponse xmlns:u="x"/></s:Body></s:Envelope>"#;
        let envelope = Element::parse(xml.as_bytes()).unwrap();
        let body = find_child_with_suffix(&envelope, "Body").unwrap();
        let response = find_child_with_suffix(body, "StopResponse").unwrap();
        assert!(matches!(
            extract_child_text(response, "Track"),
            Err(ControlError::MissingField(_))
        ));
    }
}
