pub mod buffers;
pub mod device;
