pub mod mime;
pub mod path;
pub mod xml;
