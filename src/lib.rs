//! Bidirectional low-latency video + telemetry + command link between an
//! airborne node ("drone") and a ground station ("GS").
//!
//! Both sides share a framed UDP protocol carrying encoded video keyframe
//! control, MSP DisplayPort OSD overlays, bounding-box detections, periodic
//! system telemetry, synchronous request/response commands, and RC channel
//! frames. The drone streams hardware-encoded H.264/H.265 over RTP to the
//! GS, which decodes into DMA-backed frames and composites them with an OSD
//! glyph plane on a layered display.
//!
//! # Crate layout
//!
//! - [`link`] — the symmetric UDP peer runtime shared by both sides
//! - [`command`] — the drone-side GET/SET command dispatcher
//! - [`camera`] — capture device discovery, ranking and encoder binding
//! - [`telemetry`] — CPU / transport / modem statistics producer
//! - [`proxy`] — auxiliary UDP relays toward a remote ground station
//! - [`video`] — GS-side RTP ingress, decoder loop and presenter
//! - [`osd`] — MSP DisplayPort character grid and ARGB compositor
//! - [`wfb`] — WFB status-link listener feeding the OSD overlay
//! - [`hal`] — default implementations of the hardware collaborator traits
//!
//! Hardware SDKs (codec, ISP, DRM, 2D blitter) are deliberately kept behind
//! traits so the pipeline logic stays testable off-target.

pub mod camera;
pub mod command;
pub mod config;
pub mod encoder;
pub mod hal;
pub mod link;
pub mod osd;
pub mod proxy;
pub mod telemetry;
pub mod video;
pub mod wfb;

pub use config::Config;
pub use link::{LinkPeer, LinkRole, LinkSender};
