pub const SUCCESS: i32 = 0;
/// Failure outside the pipeline, e.g. the report could not be written
pub const EXECUTION_ERROR: i32 = 1;
/// Session file missing, unparseable or rejected before anything was spawned
pub const INPUT_ERROR: i32 = 2;
/// The session started and halted: setup failure, missed tick or step fault
pub const PIPELINE_HALTED: i32 = 3;
