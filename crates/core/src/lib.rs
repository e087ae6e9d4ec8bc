mod batch;
mod command;
pub mod config;
mod error;
mod fileset;
mod mirror;
pub mod progress;
pub mod run_log;
mod spec;
mod transfer;
pub mod transport;

pub const APP_NAME: &str = "fleetput";

pub use batch::{DispatchEntry, dispatch_all, dispatch_all_with};
pub use command::{
    CommandOptions, CommandOutput, CommandResult, CommandTarget, HostRun, RemoteShell,
    ScriptedReply, ScriptedShell, SshShell, run_command, run_on_all,
};
pub use error::{Error, ErrorKind, Result};
pub use fileset::{
    DEFAULT_PATTERN, EntryKind, FileSet, TreeEntry, TreeWalk, WalkFailure, resolve_files,
    resolve_tree,
};
pub use mirror::{DirFailure, MirrorReport, MirrorRequest, mirror, mirror_with};
pub use progress::{ProgressEvent, ProgressShape, ProgressSink, ProgressState, ProgressTracker};
pub use spec::{
    Credentials, DestinationSpec, ParsedSpecs, Protocol, RejectedEntry, parse_inline, parse_list,
    read_list_file,
};
pub use transfer::{
    DestinationReport, TransferOptions, TransferOutcome, TransferRequest, TransferStatus,
    transfer, transfer_with,
};
pub use transport::{Connector, InMemoryConnector, Notice, ProtocolConnector, Session};
