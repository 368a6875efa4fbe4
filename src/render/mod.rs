pub mod compose;
pub mod convert;
pub mod mesh;
pub mod raster;
pub mod scene;
#[cfg(feature = "desktop")]
pub mod window;

pub use compose::{bgra_to_bgr, blend, rgba_to_bgra};
pub use convert::{pose_to_render_camera, to_render_camera};
pub use mesh::{Mesh, Model, PrimitiveModelFactory};
pub use raster::SoftwareRenderer;
pub use scene::{ModelFactory, SceneCache, SceneHandle};
#[cfg(feature = "desktop")]
pub use window::MinifbRenderer;
