pub mod allocator;
pub(crate) mod shared;
