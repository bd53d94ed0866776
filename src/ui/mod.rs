//! Console front end: key encoding, session tabs and rendering.

pub mod input;
pub mod renderer;
pub mod tabs;

pub use renderer::{Palette, Renderer};
pub use tabs::Tabs;
