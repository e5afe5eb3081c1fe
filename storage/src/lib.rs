pub mod community;
pub mod index;
pub mod narratives;
pub mod repo;
pub mod snapshot;
