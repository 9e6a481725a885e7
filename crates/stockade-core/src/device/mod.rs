//! Block device plumbing: loop attachment and encrypted device unlocking.

pub mod crypt;
pub mod loopdev;

pub use crypt::unlock;
pub use loopdev::attach_image;
