pub mod logger;
pub mod proxy;
