pub mod split_rw_lock;
pub mod striped_lock;

pub use split_rw_lock::{
    new_split_rw_lock,
    Reader,
    Writer,
};
pub use striped_lock::StripedLock;
