pub mod log_file;
pub mod record_store;

pub use record_store::RecordStore;
