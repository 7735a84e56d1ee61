// Domain layer: models and ports (interfaces) shared by core and app.

pub mod model;
pub mod ports;
