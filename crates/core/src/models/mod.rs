pub mod address_list;
pub mod backup;
pub mod device;
pub mod schedule;
pub mod task;
pub mod task_run;

pub use address_list::{AddressListEntry, ListSemantics};
pub use backup::Backup;
pub use device::{Device, DeviceGroup, DeviceHealth, DeviceId, GroupId, HealthState};
pub use schedule::{Schedule, ScheduleDay};
pub use task::{Action, BackupKind, Target, Task, TaskId};
pub use task_run::{ExecutionRecord, TaskRun, TaskRunStatus};
