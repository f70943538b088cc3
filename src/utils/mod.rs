mod drop_join_handle;

pub use drop_join_handle::OwnedJoinHandle;
