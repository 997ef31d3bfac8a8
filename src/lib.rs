pub mod chunked;
pub mod config;
pub mod dirlist;
pub mod events;
pub mod http;
pub mod iface;
pub mod media;
pub mod server;
pub mod soap;
pub mod ssdp;
pub mod static_xml;
pub mod util;
