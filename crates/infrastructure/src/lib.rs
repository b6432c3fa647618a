pub mod backup_fs;
pub mod fleet_file;
pub mod record_sink;
pub mod vault;

pub use backup_fs::FsBackupStorage;
pub use fleet_file::{load_fleet_file, MemoryDeviceDirectory, MemoryTaskStore};
pub use record_sink::{JsonlRecordSink, MemoryRecordSink};
pub use vault::StaticVault;
