pub mod store;
mod tables;

pub use store::NodeStore;
