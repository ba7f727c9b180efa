//! Collaborative drawing surface: stroke codec, raster render target and the
//! controller that owns the replicated stroke log.

pub mod codec;
pub mod controller;
pub mod surface;

pub use codec::StrokeEncoder;
pub use controller::{DrawingSurfaceController, LogInsert, StrokeLog};
pub use surface::{BlendMode, Brush, CoverageMask, DrawingSurface, RasterSurface};
