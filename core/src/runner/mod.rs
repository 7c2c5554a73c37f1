//! Per-task process runner: spawning with the control pipe, the control-channel
//! protocol, the control socket, background supervision and output aggregation.

mod aggregator;
mod background;
mod console;
mod control;
mod control_socket;
mod io_pump;
mod process;

pub use aggregator::{spawn_aggregator, AggregatorOptions, SectionLabel};
pub use background::{run_finally, BackgroundSupervisor, ShellContext};
pub use console::{Console, HeaderKind};
pub use control::{spawn_control_reader, ControlCommand, ControlDispatcher, ShellCommand};
pub use control_socket::{ControlSocket, CONTROL_SOCKET_ENV};
pub use io_pump::{pump_lines, LineStream, LineTap};
pub use process::{
    new_process_group, signal_group, spawn_task, GroupSignal, SpawnedTask, StdioMode, TaskSpawn,
    CONTROL_FD,
};
