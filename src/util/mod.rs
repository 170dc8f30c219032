pub mod buf_ext;
pub mod random;
