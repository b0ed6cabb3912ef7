//! # sabdidl - DIDL-Lite generation
//!
//! Minimal DIDL-Lite metadata for AVTransport `SetAVTransportURI`. Sonos
//! players only need an `object.item.audioItem.musicTrack` with title,
//! creator and a `res` element whose `protocolInfo` matches the stream
//! MIME type; everything else is ignored.

use serde::Serialize;
use thiserror::Error;

const XMLNS_DIDL: &str = "urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/";
const XMLNS_DC: &str = "http://purl.org/dc/elements/1.1/";
const XMLNS_UPNP: &str = "urn:schemas-upnp-org:metadata-1-0/upnp/";
const CLASS_MUSIC_TRACK: &str = "object.item.audioItem.musicTrack";

#[derive(Error, Debug)]
pub enum DidlError {
    #[error("DIDL serialization error: {0}")]
    Serialize(#[from] quick_xml::SeError),
}

/// Root of a DIDL-Lite document.
#[derive(Debug, Serialize)]
#[serde(rename = "DIDL-Lite")]
struct DidlLite {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,

    #[serde(rename = "@xmlns:dc")]
    xmlns_dc: &'static str,

    #[serde(rename = "@xmlns:upnp")]
    xmlns_upnp: &'static str,

    #[serde(rename = "item")]
    items: Vec<Item>,
}

#[derive(Debug, Serialize)]
struct Item {
    #[serde(rename = "@id")]
    id: String,

    #[serde(rename = "@parentID")]
    parent_id: String,

    #[serde(rename = "@restricted")]
    restricted: String,

    #[serde(rename = "dc:title")]
    title: String,

    #[serde(rename = "dc:creator", skip_serializing_if = "Option::is_none")]
    creator: Option<String>,

    #[serde(rename = "upnp:class")]
    class: String,

    #[serde(rename = "res")]
    res: Vec<Res>,
}

#[derive(Debug, Serialize)]
struct Res {
    #[serde(rename = "@protocolInfo")]
    protocol_info: String,

    #[serde(rename = "$text")]
    url: String,
}

/// Builds the metadata document for one audio track.
///
/// Free text is escaped by the serializer; the caller passes raw strings.
pub fn audio_track_metadata(
    item_id: &str,
    title: &str,
    creator: Option<&str>,
    stream_url: &str,
    mime_type: &str,
) -> Result<String, DidlError> {
    let didl = DidlLite {
        xmlns: XMLNS_DIDL,
        xmlns_dc: XMLNS_DC,
        xmlns_upnp: XMLNS_UPNP,
        items: vec![Item {
            id: item_id.to_string(),
            parent_id: "-1".to_string(),
            restricted: "1".to_string(),
            title: title.to_string(),
            creator: creator.map(str::to_string),
            class: CLASS_MUSIC_TRACK.to_string(),
            res: vec![Res {
                protocol_info: format!("http-get:*:{}:*", mime_type),
                url: stream_url.to_string(),
            }],
        }],
    };

    Ok(quick_xml::se::to_string(&didl)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_music_track_item() {
        let xml = audio_track_metadata(
            "item-1",
            "Dune",
            Some("Frank Herbert"),
            "http://bridge.local:8080/stream/tok/audio.m4a",
            "audio/mp4",
        )
        .unwrap();

        assert!(xml.contains("object.item.audioItem.musicTrack"));
        assert!(xml.contains("<dc:title>Dune</dc:title>"));
        assert!(xml.contains("<dc:creator>Frank Herbert</dc:creator>"));
        assert!(xml.contains(r#"protocolInfo="http-get:*:audio/mp4:*""#));
        assert!(xml.contains("http://bridge.local:8080/stream/tok/audio.m4a"));
        assert!(xml.contains(r#"xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/""#));
    }

    #[test]
    fn escapes_free_text() {
        let xml = audio_track_metadata(
            "item-1",
            "Cats & Dogs <vol. 1>",
            None,
            "http://bridge.local/stream/t/audio.mp3",
            "audio/mpeg",
        )
        .unwrap();

        assert!(xml.contains("Cats &amp; Dogs &lt;vol. 1&gt;"));
        assert!(!xml.contains("<dc:creator>"));
    }
}
