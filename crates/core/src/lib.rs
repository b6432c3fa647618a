pub mod cancel;
pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use cancel::CancelFlag;
pub use config::{AppConfig, ConnectorConfig, DispatcherConfig, HealthConfig, RetryConfig, SchedulerConfig};
pub use errors::{ErrorKind, FleetError, Result};
pub use models::{
    Action, AddressListEntry, Backup, BackupKind, Device, DeviceGroup, DeviceHealth, DeviceId,
    ExecutionRecord, GroupId, HealthState, ListSemantics, Schedule, ScheduleDay, Target, Task,
    TaskId, TaskRun, TaskRunStatus,
};
pub use traits::{
    BackupStorage, CommandReply, CommandRunner, CredentialVault, DeviceDirectory, DeviceEndpoint,
    DeviceSession, EntryOp, EntryRejection, ExecutionContext, ExecutionOutcome,
    ExecutionRecordSink, HealthProbe, SessionFactory, TaskStore,
};
