// Domain layer: models and ports. Concrete implementations live in adapters.

pub mod model;
pub mod ports;
