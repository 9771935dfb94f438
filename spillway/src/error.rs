use crate::vk;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}
