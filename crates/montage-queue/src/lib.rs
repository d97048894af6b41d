// Montage Queue
// Durable work-queue contract plus the zombie-job health monitor

mod monitor;
mod queue;

pub use monitor::{
    JobHealthMonitor, MonitorConfig, ReconcileTier, SweepPhase, SweepReport, ZombieRecord,
};
pub use queue::{JobQueue, JobState, MemoryJobQueue, QueuedJob};
