//! Renderer discovery: SSDP sweep, description filtering, topology
//! classification, registry upsert.

use crate::description::{self, DeviceDescription};
use crate::errors::ControlError;
use crate::ssdp;
use crate::topology::{self, ZoneGroup};
use sabstore::{NewDevice, Store};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SSDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-device result of the topology classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_hidden: bool,
    pub group_size: u32,
}

impl Classification {
    fn standalone() -> Self {
        Self {
            is_hidden: false,
            group_size: 1,
        }
    }
}

/// Classifies every zone member per the topology rules:
/// invisible member → hidden; visible non-coordinator of a multi-device
/// group → hidden; coordinator of a multi-device group → visible with the
/// visible-member count; anything else → standalone.
pub fn classify_devices(groups: &[ZoneGroup]) -> HashMap<String, Classification> {
    let mut result = HashMap::new();

    for group in groups {
        let visible_count = group.visible_member_count();
        for member in &group.members {
            let classification = if member.invisible {
                Classification {
                    is_hidden: true,
                    group_size: 1,
                }
            } else if visible_count > 1 && member.uuid != group.coordinator {
                Classification {
                    is_hidden: true,
                    group_size: 1,
                }
            } else if visible_count > 1 && member.uuid == group.coordinator {
                Classification {
                    is_hidden: false,
                    group_size: visible_count,
                }
            } else {
                Classification::standalone()
            };
            result.insert(member.uuid.clone(), classification);
        }
    }

    result
}

/// Discovery front-end over the device registry.
#[derive(Clone)]
pub struct Discovery {
    store: Arc<Store>,
}

impl Discovery {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Full pass: SSDP sweep, description fetch, topology classification,
    /// registry upsert. Returns the number of reachable Sonos devices.
    pub async fn discover(&self) -> Result<usize, ControlError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || discover_blocking(&store))
            .await
            .map_err(|e| ControlError::Parse(format!("discovery task failed: {}", e)))?
    }

    /// Re-runs topology classification only; no SSDP. Cheap enough for a UI
    /// refresh button.
    pub async fn refresh_groups(&self) -> Result<(), ControlError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || apply_topology(&store))
            .await
            .map_err(|e| ControlError::Parse(format!("refresh task failed: {}", e)))?
    }
}

fn discover_blocking(store: &Store) -> Result<usize, ControlError> {
    store.mark_all_devices_unreachable()?;

    let locations = ssdp::search(ssdp::ZONEPLAYER_SEARCH_TARGET, SSDP_TIMEOUT)?;
    info!("📡 SSDP sweep found {} location(s)", locations.len());

    let mut found = 0usize;
    for location in &locations {
        let desc = match description::fetch_description(location) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to fetch description {}: {}", location, e);
                continue;
            }
        };

        if !desc.is_sonos() {
            debug!("Skipping non-Sonos device at {}", location);
            continue;
        }

        store.upsert_device(&to_new_device(&desc, location))?;
        found += 1;
    }

    if found > 0 {
        if let Err(e) = apply_topology(store) {
            warn!("Topology refresh failed after discovery: {}", e);
        }
    }

    Ok(found)
}

fn to_new_device(desc: &DeviceDescription, location: &str) -> NewDevice {
    NewDevice {
        uuid: desc.uuid().to_string(),
        name: desc.display_name().to_string(),
        ip: desc.ip.clone(),
        location_url: location.to_string(),
        model: desc.model_name.clone(),
    }
}

/// Queries one reachable device for the zone state and writes the
/// classification of every known device back to the registry.
fn apply_topology(store: &Store) -> Result<(), ControlError> {
    let devices = store.list_devices()?;

    let source = devices
        .iter()
        .find(|d| d.is_reachable)
        .ok_or(ControlError::NoTopologySource)?;

    let groups = topology::get_zone_group_state(&source.ip)?;
    let classifications = classify_devices(&groups);
    debug!(
        "Topology: {} group(s), {} classified member(s)",
        groups.len(),
        classifications.len()
    );

    for device in &devices {
        let class = classifications
            .get(&device.uuid)
            .cloned()
            .unwrap_or_else(Classification::standalone);
        store.set_device_topology(&device.uuid, class.is_hidden, class.group_size)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ZoneMember;

    fn member(uuid: &str, invisible: bool) -> ZoneMember {
        ZoneMember {
            uuid: uuid.to_string(),
            zone_name: uuid.to_string(),
            invisible,
        }
    }

    #[test]
    fn stereo_pair_slave_is_hidden() {
        let groups = vec![ZoneGroup {
            coordinator: "A".to_string(),
            members: vec![member("A", false), member("B", true)],
        }];

        let map = classify_devices(&groups);
        assert_eq!(
            map["A"],
            Classification {
                is_hidden: false,
                group_size: 1
            }
        );
        assert_eq!(
            map["B"],
            Classification {
                is_hidden: true,
                group_size: 1
            }
        );
    }

    #[test]
    fn grouped_members_hide_behind_coordinator() {
        let groups = vec![ZoneGroup {
            coordinator: "A".to_string(),
            members: vec![member("A", false), member("B", false), member("C", false)],
        }];

        let map = classify_devices(&groups);
        assert_eq!(
            map["A"],
            Classification {
                is_hidden: false,
                group_size: 3
            }
        );
        assert!(map["B"].is_hidden);
        assert!(map["C"].is_hidden);
    }

    #[test]
    fn standalone_device() {
        let groups = vec![ZoneGroup {
            coordinator: "A".to_string(),
            members: vec![member("A", false)],
        }];

        let map = classify_devices(&groups);
        assert_eq!(map["A"], Classification::standalone());
    }

    #[test]
    fn paired_group_counts_visible_members_only() {
        // Two stereo pairs grouped together: 4 devices, 2 visible
        let groups = vec![ZoneGroup {
            coordinator: "A".to_string(),
            members: vec![
                member("A", false),
                member("A2", true),
                member("B", false),
                member("B2", true),
            ],
        }];

        let map = classify_devices(&groups);
        assert_eq!(
            map["A"],
            Classification {
                is_hidden: false,
                group_size: 2
            }
        );
        assert!(map["B"].is_hidden);
        assert!(map["A2"].is_hidden);
        assert_eq!(map["A2"].group_size, 1);
    }
}
