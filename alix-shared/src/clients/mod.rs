mod rabbitmq;

pub use rabbitmq::*;
