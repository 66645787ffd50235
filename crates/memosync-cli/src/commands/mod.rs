pub mod category;
pub mod common;
pub mod memo;
pub mod sync;
