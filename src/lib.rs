pub mod calibration;
#[cfg(feature = "desktop")]
pub mod camera;
pub mod catalog;
pub mod config;
pub mod dialogue;
pub mod face;
pub mod frame;
pub mod games;
pub mod marker;
pub mod pipeline;
pub mod render;
pub mod store;
pub mod voice;
