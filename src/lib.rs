pub mod address_book;
pub mod behaviour;
pub mod dispatch;
pub mod expose;
pub mod gateway;
pub mod host;
pub mod identity;
pub mod node;
pub mod peerstore;
pub mod protocol;
pub mod proxy;
pub mod resolve;
pub mod shutdown;
pub mod stats;
pub mod tunnel;
pub mod types;

#[cfg(test)]
pub mod test_utils;
