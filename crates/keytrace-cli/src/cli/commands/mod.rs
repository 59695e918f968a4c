mod dispatch;
pub mod keys;
pub mod matching;
pub mod providers;
pub mod recipe;
pub mod verify;

pub use dispatch::dispatch;
