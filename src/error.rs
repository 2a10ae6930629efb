use std::io;

/// Logic errors internal to the reactor: violated threading invariants,
/// stale handles, and the like. OS-facing failures stay as `io::Error`
/// and never go through this type — see spec §7's Transient I/O / Peer
/// close / Hard I/O / Resource exhaustion kinds, which are all plain
/// `io::Error`s produced at the syscall boundary.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("operation attempted from thread {actual:?}, but this object is owned by thread {owner:?}")]
    NotOwnerThread {
        owner: std::thread::ThreadId,
        actual: std::thread::ThreadId,
    },

    #[error("timer handle is stale: already cancelled or fired")]
    UnknownTimer,

    #[error("connection {name:?} is not in a state that accepts this operation")]
    InvalidConnectionState { name: String },

    #[error("connector already stopped")]
    ConnectorStopped,
}

impl From<ReactorError> for io::Error {
    fn from(e: ReactorError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }
}
