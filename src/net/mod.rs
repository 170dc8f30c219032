pub mod dispatcher;
pub mod driver;
pub mod host;
pub mod net_config;
pub mod packet_handler;
pub mod registry;
pub mod request;
pub mod transport;
pub mod wire;
