//! # sabcontrol - Sonos discovery and transport control
//!
//! Control-point side of the bridge: SSDP discovery of ZonePlayers,
//! ZoneGroupTopology classification (coordinators, grouped members,
//! invisible stereo-pair slaves), and the SOAP clients for AVTransport,
//! RenderingControl and GroupRenderingControl.
//!
//! SOAP calls are blocking (one short HTTP POST each); async callers wrap
//! them in `spawn_blocking`.

pub mod avtransport;
pub mod description;
pub mod discovery;
pub mod errors;
pub mod group_rendering;
pub mod rendering_control;
pub mod soap;
pub mod ssdp;
pub mod topology;

pub use avtransport::{AvTransportClient, PositionInfo, TransportInfo};
pub use discovery::{classify_devices, Classification, Discovery};
pub use errors::{ControlError, TRANSITION_NOT_AVAILABLE};
pub use group_rendering::GroupRenderingClient;
pub use rendering_control::RenderingControlClient;
