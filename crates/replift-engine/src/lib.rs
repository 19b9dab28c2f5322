mod cleanup;
mod execute;
mod extract;
mod files;
mod layout;
mod ledger;
mod patch;
mod process;
mod record;
mod registry;
mod selfupdate;
mod sequencer;
mod types;
mod uninstall;

pub use cleanup::{
    create_shortcuts, delete_flagged_files, parse_command_text, remove_obsolete_folders,
    rollback_files, run_post_commands, FsShellOps, PostCommand, ShellOps,
};
pub use execute::{
    optimize_managed, run_post_execute, run_pre_execute, BinaryOptimizer, NoopOptimizer,
};
pub use extract::{extract_archive, load_manifest};
pub use files::{copy_with_times, count_staged_files, install_files, move_file};
pub use layout::ScratchLayout;
pub use ledger::{
    append_file_entry, append_registry_entry, parse_registry_op, read_file_entries,
    read_registry_entries, serialize_registry_op, FileLedgerEntry,
};
pub use patch::apply_patches;
pub use process::{
    ensure_not_running, kill_processes_at, probe_processes, processes_using, ProbeError,
    ProcessInfo,
};
pub use record::{ClientState, UninstallData, UninstallFile};
pub use registry::{
    apply_op, apply_plan, plan_registry, rollback_registry, FsRegistryStore, PlannedRegOp,
    RegValueData, RegistryPlan, RegistryStore,
};
pub use selfupdate::{
    delete_stray_client, find_new_client, install_new_client, is_elevated, requires_privilege,
    SelfUpdateHandoff,
};
pub use sequencer::{
    next_step, overall_percent, PatchFailurePolicy, UpdateContext, UpdateSequencer, UpdateStep,
};
pub use types::{
    CancelFlag, NullProgress, ProgressSink, StageOutcome, UpdateError, UpdateOutcome,
};
pub use uninstall::run_uninstall;

#[cfg(test)]
mod tests;
