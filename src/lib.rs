pub mod config;
pub mod docker;
pub mod firewall;
pub mod idler;
pub mod net;
pub mod packet;
pub mod queue;
pub mod systemd;
