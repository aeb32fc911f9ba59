pub mod client;
pub mod device;
pub mod pairing;
pub mod worker;
