//! Interpreter stdin backed by editor prompts.

use std::{
    io::{self, Read},
    sync::{Arc, Mutex, PoisonError},
};

use tokio::runtime::Handle;

use crate::peer::PeerSlot;

/// Prompt shown when the interpreter reads from stdin.
pub const INPUT_PROMPT: &str = "Please provide scanner input here";

const DISMISSED: &str = "User input dismissed";

/// Blocking reader that asks the peer for a line whenever it runs dry.
///
/// Must be read from a blocking thread (e.g. `spawn_blocking`), never from an
/// async task.
#[derive(Clone)]
pub struct UserInput {
    peer: PeerSlot,
    runtime: Option<Handle>,
    pending: Arc<Mutex<io::Cursor<Vec<u8>>>>,
}

impl UserInput {
    /// Create a reader bound to the current runtime, if any.
    #[must_use]
    pub fn new(peer: PeerSlot) -> Self {
        Self {
            peer,
            runtime: Handle::try_current().ok(),
            pending: Arc::default(),
        }
    }

    fn dismissed() -> io::Error {
        io::Error::new(io::ErrorKind::UnexpectedEof, DISMISSED)
    }

    fn prompt(&self) -> io::Result<Vec<u8>> {
        let Some(runtime) = self.runtime.as_ref() else {
            tracing::warn!("No runtime to request user input on");
            return Err(Self::dismissed());
        };
        let Some(peer) = self.peer.get() else {
            tracing::warn!("Peer unavailable, cannot request user input");
            return Err(Self::dismissed());
        };

        match runtime.block_on(peer.request_user_input(INPUT_PROMPT.to_string())) {
            Ok(Some(mut line)) => {
                line.push('\n');
                Ok(line.into_bytes())
            }
            Ok(None) => {
                tracing::warn!("User input is empty");
                Err(Self::dismissed())
            }
            Err(e) => {
                tracing::warn!("Failed to get user input: {e}");
                Err(Self::dismissed())
            }
        }
    }
}

impl Read for UserInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let position = usize::try_from(pending.position()).unwrap_or(usize::MAX);
        let exhausted = position >= pending.get_ref().len();
        if exhausted {
            *pending = io::Cursor::new(self.prompt()?);
        }
        pending.read(buf)
    }
}

impl std::fmt::Debug for UserInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserInput")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
