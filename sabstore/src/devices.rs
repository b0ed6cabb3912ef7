//! `sonos_devices` table: renderers found by discovery. Rows are upserted,
//! never deleted; a device that left the network is just unreachable.

use crate::{now_rfc3339, Store};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonosDevice {
    pub uuid: String,
    /// Room name when the description carries one, friendly name otherwise.
    pub name: String,
    pub ip: String,
    pub location_url: String,
    pub model: String,
    pub is_reachable: bool,
    /// Stereo-pair slave or non-coordinator group member.
    pub is_hidden: bool,
    /// Visible member count of the group this device coordinates; 1 for
    /// standalone devices and for hidden members.
    pub group_size: u32,
    pub discovered_at: String,
    pub last_seen: String,
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub uuid: String,
    pub name: String,
    pub ip: String,
    pub location_url: String,
    pub model: String,
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<SonosDevice> {
    Ok(SonosDevice {
        uuid: row.get(0)?,
        name: row.get(1)?,
        ip: row.get(2)?,
        location_url: row.get(3)?,
        model: row.get(4)?,
        is_reachable: row.get::<_, i64>(5)? != 0,
        is_hidden: row.get::<_, i64>(6)? != 0,
        group_size: row.get(7)?,
        discovered_at: row.get(8)?,
        last_seen: row.get(9)?,
    })
}

const DEVICE_COLUMNS: &str = "uuid, name, ip, location_url, model, is_reachable, is_hidden, \
     group_size, discovered_at, last_seen";

impl Store {
    /// Inserts or refreshes a discovered device. `discovered_at` of an
    /// existing row is preserved.
    pub fn upsert_device(&self, device: &NewDevice) -> rusqlite::Result<()> {
        let conn = self.conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO sonos_devices (uuid, name, ip, location_url, model,
                 is_reachable, is_hidden, group_size, discovered_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, 1, ?6, ?6)
             ON CONFLICT(uuid) DO UPDATE SET
                 name = excluded.name,
                 ip = excluded.ip,
                 location_url = excluded.location_url,
                 model = excluded.model,
                 is_reachable = 1,
                 last_seen = excluded.last_seen",
            params![
                device.uuid,
                device.name,
                device.ip,
                device.location_url,
                device.model,
                now,
            ],
        )?;
        Ok(())
    }

    /// Applies the topology classification for one device.
    pub fn set_device_topology(
        &self,
        uuid: &str,
        is_hidden: bool,
        group_size: u32,
    ) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sonos_devices SET is_hidden = ?2, group_size = ?3, last_seen = ?4
             WHERE uuid = ?1",
            params![uuid, is_hidden as i64, group_size, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_all_devices_unreachable(&self) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute("UPDATE sonos_devices SET is_reachable = 0", [])?;
        Ok(())
    }

    pub fn get_device(&self, uuid: &str) -> rusqlite::Result<Option<SonosDevice>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM sonos_devices WHERE uuid = ?1", DEVICE_COLUMNS),
            [uuid],
            row_to_device,
        )
        .optional()
    }

    pub fn list_devices(&self) -> rusqlite::Result<Vec<SonosDevice>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sonos_devices ORDER BY name",
            DEVICE_COLUMNS
        ))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    /// Devices offered as playback targets in the UI.
    pub fn list_visible_devices(&self) -> rusqlite::Result<Vec<SonosDevice>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sonos_devices
             WHERE is_reachable = 1 AND is_hidden = 0 ORDER BY name",
            DEVICE_COLUMNS
        ))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(uuid: &str, name: &str) -> NewDevice {
        NewDevice {
            uuid: uuid.to_string(),
            name: name.to_string(),
            ip: "192.168.1.50".to_string(),
            location_url: "http://192.168.1.50:1400/xml/device_description.xml".to_string(),
            model: "Sonos One".to_string(),
        }
    }

    #[test]
    fn upsert_preserves_discovered_at() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_device(&device("RINCON_1", "Kitchen")).unwrap();

        store
            .conn()
            .execute(
                "UPDATE sonos_devices SET discovered_at = '2020-01-01T00:00:00+00:00'",
                [],
            )
            .unwrap();

        store
            .upsert_device(&device("RINCON_1", "Kitchen (move)"))
            .unwrap();
        let d = store.get_device("RINCON_1").unwrap().unwrap();
        assert_eq!(d.discovered_at, "2020-01-01T00:00:00+00:00");
        assert_eq!(d.name, "Kitchen (move)");
        assert!(d.is_reachable);
    }

    #[test]
    fn topology_classification() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_device(&device("RINCON_1", "Kitchen")).unwrap();
        store.upsert_device(&device("RINCON_2", "Kitchen (R)")).unwrap();

        store.set_device_topology("RINCON_1", false, 2).unwrap();
        store.set_device_topology("RINCON_2", true, 1).unwrap();

        let visible = store.list_visible_devices().unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].uuid, "RINCON_1");
        assert_eq!(visible[0].group_size, 2);
    }

    #[test]
    fn unreachable_sweep() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_device(&device("RINCON_1", "Kitchen")).unwrap();
        store.mark_all_devices_unreachable().unwrap();
        assert!(!store.get_device("RINCON_1").unwrap().unwrap().is_reachable);

        // Re-discovery flips it back
        store.upsert_device(&device("RINCON_1", "Kitchen")).unwrap();
        assert!(store.get_device("RINCON_1").unwrap().unwrap().is_reachable);
    }
}
