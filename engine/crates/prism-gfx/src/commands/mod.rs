pub mod barrier;
pub mod command;
pub mod encoder;
pub mod image_state;
pub mod submit_info;
