pub mod relay;
pub mod worker;
