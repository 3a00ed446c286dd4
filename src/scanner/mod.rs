pub mod discovery;

pub use discovery::discover_images;
