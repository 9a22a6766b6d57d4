pub mod codes;
pub mod engine;
pub mod events;
pub mod feed;
pub mod lifecycle;
pub mod payment;
pub mod redis_store;
pub mod refund;
pub mod store;
pub mod sweeper;
pub mod tasks;
pub mod watcher;

pub use codes::*;
pub use engine::*;
pub use events::*;
pub use feed::*;
pub use lifecycle::*;
pub use payment::*;
pub use redis_store::*;
pub use refund::*;
pub use store::*;
pub use sweeper::*;
pub use tasks::*;
pub use watcher::*;
