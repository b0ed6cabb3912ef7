//! ZoneGroupTopology: the authoritative view of groups and stereo pairs.
//!
//! Any single reachable player can be asked for the full household state.
//! The interesting payload (`ZoneGroupState`) is an XML document escaped
//! inside the SOAP response text.

use crate::errors::ControlError;
use crate::soap::{expect_response, extract_child_text, invoke_with_retry};
use xmltree::{Element, XMLNode};

const ZONE_TOPOLOGY_SERVICE: &str = "urn:schemas-upnp-org:service:ZoneGroupTopology:1";
const ZONE_TOPOLOGY_CONTROL: &str = "/ZoneGroupTopology/Control";

#[derive(Debug, Clone)]
pub struct ZoneMember {
    pub uuid: String,
    pub zone_name: String,
    /// Stereo-pair slave (or other topology-hidden member).
    pub invisible: bool,
}

#[derive(Debug, Clone)]
pub struct ZoneGroup {
    pub coordinator: String,
    pub members: Vec<ZoneMember>,
}

impl ZoneGroup {
    pub fn visible_member_count(&self) -> u32 {
        self.members.iter().filter(|m| !m.invisible).count() as u32
    }
}

/// Queries one player for the household zone state.
pub fn get_zone_group_state(ip: &str) -> Result<Vec<ZoneGroup>, ControlError> {
    let control_url = format!("http://{}:1400{}", ip, ZONE_TOPOLOGY_CONTROL);
    let result = invoke_with_retry(
        &control_url,
        ZONE_TOPOLOGY_SERVICE,
        "GetZoneGroupState",
        &[],
    )?;

    let response = expect_response("GetZoneGroupState", &result)?;
    let state_xml = extract_child_text(response, "ZoneGroupState")?;
    parse_zone_group_state(&state_xml)
}

/// Parses the unescaped `ZoneGroupState` document.
pub fn parse_zone_group_state(xml: &str) -> Result<Vec<ZoneGroup>, ControlError> {
    let root = Element::parse(xml.as_bytes())
        .map_err(|e| ControlError::Parse(format!("ZoneGroupState: {}", e)))?;

    let mut groups = Vec::new();
    collect_zone_groups(&root, &mut groups);
    Ok(groups)
}

fn collect_zone_groups(element: &Element, groups: &mut Vec<ZoneGroup>) {
    if element.name.ends_with("ZoneGroup") && !element.name.ends_with("ZoneGroupMember") {
        if let Some(group) = parse_zone_group(element) {
            groups.push(group);
        }
        return;
    }
    for node in &element.children {
        if let XMLNode::Element(child) = node {
            collect_zone_groups(child, groups);
        }
    }
}

fn parse_zone_group(element: &Element) -> Option<ZoneGroup> {
    let coordinator = element.attributes.get("Coordinator")?.clone();

    let members = element
        .children
        .iter()
        .filter_map(|node| match node {
            XMLNode::Element(child) if child.name.ends_with("ZoneGroupMember") => {
                Some(ZoneMember {
                    uuid: child.attributes.get("UUID")?.clone(),
                    zone_name: child
                        .attributes
                        .get("ZoneName")
                        .cloned()
                        .unwrap_or_default(),
                    invisible: child
                        .attributes
                        .get("Invisible")
                        .map(|v| v == "1")
                        .unwrap_or(false),
                })
            }
            _ => None,
        })
        .collect();

    Some(ZoneGroup {
        coordinator,
        members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: &str = r#"<ZoneGroupState>
        <ZoneGroups>
          <ZoneGroup Coordinator="RINCON_A" ID="RINCON_A:1">
            <ZoneGroupMember UUID="RINCON_A" ZoneName="Living Room" Invisible="0"/>
            <ZoneGroupMember UUID="RINCON_B" ZoneName="Living Room" Invisible="1"/>
          </ZoneGroup>
          <ZoneGroup Coordinator="RINCON_C" ID="RINCON_C:7">
            <ZoneGroupMember UUID="RINCON_C" ZoneName="Kitchen"/>
            <ZoneGroupMember UUID="RINCON_D" ZoneName="Bedroom"/>
          </ZoneGroup>
        </ZoneGroups>
      </ZoneGroupState>"#;

    #[test]
    fn parses_groups_and_members() {
        let groups = parse_zone_group_state(STATE).unwrap();
        assert_eq!(groups.len(), 2);

        let pair = &groups[0];
        assert_eq!(pair.coordinator, "RINCON_A");
        assert_eq!(pair.members.len(), 2);
        assert!(pair.members[1].invisible);
        assert_eq!(pair.visible_member_count(), 1);

        let grouped = &groups[1];
        assert_eq!(grouped.visible_member_count(), 2);
        assert_eq!(grouped.members[1].zone_name, "Bedroom");
    }

    #[test]
    fn accepts_zonegroups_root() {
        // Older firmware answers without the ZoneGroupState wrapper
        let xml = r#"<ZoneGroups>
            <ZoneGroup Coordinator="RINCON_A">
              <ZoneGroupMember UUID="RINCON_A" ZoneName="Den"/>
            </ZoneGroup>
          </ZoneGroups>"#;
        let groups = parse_zone_group_state(xml).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members[0].zone_name, "Den");
    }

    #[test]
    fn malformed_state_is_an_error() {
        assert!(parse_zone_group_state("<unclosed").is_err());
    }
}
