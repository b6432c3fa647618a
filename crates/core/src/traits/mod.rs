pub mod probe;
pub mod registry;
pub mod runner;
pub mod session;
pub mod sink;
pub mod vault;

pub use probe::HealthProbe;
pub use registry::{DeviceDirectory, TaskStore};
pub use runner::{CommandRunner, ExecutionContext, ExecutionOutcome};
pub use session::{CommandReply, DeviceSession, EntryOp, EntryRejection, SessionFactory};
pub use sink::{BackupStorage, ExecutionRecordSink};
pub use vault::{CredentialVault, DeviceEndpoint};
