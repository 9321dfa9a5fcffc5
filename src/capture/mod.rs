pub mod frame;

pub use frame::BufferUsage;
pub use frame::PixelFormat;
pub use frame::Rect;
