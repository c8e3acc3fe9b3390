//! Repository traits for metadata operations.

pub mod locks;
pub mod sessions;

pub use locks::SessionLockRepo;
pub use sessions::SessionRepo;
