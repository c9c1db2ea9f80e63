use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::net::UnixStream;

/// Identity of the process on the other end of a bus socket, as reported by
/// the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCredentials {
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredentials {
    pub(crate) fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            pid: cred.pid(),
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }
}

/// Predicate deciding whether a peer may hold the connection.
pub type PeerAuthenticator = Arc<dyn Fn(&PeerCredentials) -> bool + Send + Sync>;

/// Authenticator admitting only peers running as `uid`.
pub fn allow_uid(uid: u32) -> PeerAuthenticator {
    Arc::new(move |peer: &PeerCredentials| peer.uid == uid)
}
