pub mod device;
pub mod supervisor;
