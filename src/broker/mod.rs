pub mod cache;
pub mod select;

pub use cache::BrokerCache;
pub use select::BrokerSelector;
