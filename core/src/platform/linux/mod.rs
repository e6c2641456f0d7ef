pub mod camera;
pub mod loopback;
pub mod screen;
