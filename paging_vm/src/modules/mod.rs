pub mod filesystem;
pub mod persistent_storage;
