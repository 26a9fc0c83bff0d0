pub mod hashindex;
pub mod image;
pub mod notifier;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod scanner;
pub mod storage;
pub mod tarball;
pub mod wordlist;

// Re-exports for easy access
pub use hashindex::HashIndex;
pub use image::{image_hash, ImageMeta};
pub use notifier::Notifier;
pub use processor::ImageProcessor;
pub use registry::RegistryClient;
pub use storage::{CachePath, StorageOptions};
