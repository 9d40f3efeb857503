pub mod endpoint;
pub mod relay;
pub mod settings;
pub mod status;
pub mod transport;
