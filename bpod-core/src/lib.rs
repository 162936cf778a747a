#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

// Host-side client for a trial-sequencer state machine device.
//
// A trial is described as a symbolic state machine, compiled against the
// device's channel map, sent as one binary program, and run by the device on
// its own. While it runs, the host replays the device's transition rules over
// the streamed event codes and rebuilds which states were visited and when.

pub mod assembler;
pub mod device;
pub mod error;
pub mod hardware;
pub mod interpreter;
pub mod transport;
pub mod trial;
pub mod wire;

use std::io::{Read, Write};

pub use assembler::{
    Destination, EXIT_STATE, FinalizedStateMachine, GlobalTimerConfig, StateMachine, Target,
};
pub use device::{
    Device, DeviceConfig, InputEnablePolicy, OverrideTarget, SyncMode, describe_hardware,
};
pub use error::{CapacityError, Error, NamingError, ProtocolError, Result, TransportError};
pub use hardware::{ChannelMap, EventBand, HardwareDescription};
pub use interpreter::{Phase, RawEventLog, TrialInterpreter};
pub use trial::{Interval, SessionData, TrialRecord};
pub use wire::ProgramImage;

/// Resolves every reference in `machine` and encodes it for its channel map.
///
/// Naming and reference errors surface here, before anything is written to
/// a device.
pub fn compile(machine: StateMachine<'_>) -> Result<(FinalizedStateMachine, Vec<u8>)> {
    let map = machine.channel_map();
    let finalized = machine.finalize()?;
    let bytes = wire::encode(&finalized, map)?;
    Ok((finalized, bytes))
}

/// Interprets one trial from a stream positioned at its first opcode frame
/// and materializes the record.
pub fn run_trial<S: Read + Write>(
    stream: &mut S,
    machine: &FinalizedStateMachine,
    map: &ChannelMap,
) -> Result<TrialRecord> {
    let mut link = transport::TypedLink::new(stream);
    let log = TrialInterpreter::new(machine, map).run(&mut link)?;
    trial::materialize(&log, machine, map)
}
