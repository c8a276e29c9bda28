pub mod bluetooth;
pub mod data_plane;
pub mod logging;
