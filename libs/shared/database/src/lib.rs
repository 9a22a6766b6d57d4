pub mod redis_pool;

pub use redis_pool::{connect, connect_url, RedisPool};
