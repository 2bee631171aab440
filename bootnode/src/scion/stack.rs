use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::{debug, info};
use tos_bootnode_common::tokio::net::UnixStream;

use super::address::{IsdAs, ScionAddr};
use super::error::{ScionError, ScionResult};
use super::socket::PathAwareSocket;

pub const DEFAULT_DAEMON_SOCKET_DIR: &str = "/run/shm/sciond";
pub const DEFAULT_DISPATCHER_SOCKET: &str = "/run/shm/dispatcher/default.sock";

/// Filesystem locations of the local control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPaths {
    pub daemon_dir: PathBuf,
    pub dispatcher_socket: PathBuf,
}

impl Default for StackPaths {
    fn default() -> Self {
        Self {
            daemon_dir: PathBuf::from(DEFAULT_DAEMON_SOCKET_DIR),
            dispatcher_socket: PathBuf::from(DEFAULT_DISPATCHER_SOCKET),
        }
    }
}

impl StackPaths {
    /// `<daemon_dir>/sd<ISD>-<AS>.sock`, AS in decimal.
    pub fn daemon_socket(&self, ia: &IsdAs) -> PathBuf {
        self.daemon_dir.join(format!("sd{}-{}.sock", ia.isd, ia.asn))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackContext {
    pub ia: IsdAs,
    pub daemon_socket: PathBuf,
    pub dispatcher_socket: PathBuf,
}

/// Process-wide path-aware networking context.
///
/// Initialisation happens once per process; repeating it for the same AS is
/// a no-op, switching to another AS is refused.
#[derive(Debug, Default)]
pub struct ScionStack {
    context: Mutex<Option<StackContext>>,
}

lazy_static! {
    static ref GLOBAL_STACK: Arc<ScionStack> = Arc::new(ScionStack::new());
}

/// The stack shared by the whole process.
pub fn global() -> Arc<ScionStack> {
    GLOBAL_STACK.clone()
}

/// Initialise the process-wide stack.
pub async fn init(ia: IsdAs, daemon_socket: &Path, dispatcher_socket: &Path) -> ScionResult<()> {
    GLOBAL_STACK.init(ia, daemon_socket, dispatcher_socket).await
}

/// Open a socket on the process-wide stack.
pub async fn bind(addr: &ScionAddr) -> ScionResult<PathAwareSocket> {
    GLOBAL_STACK.bind(addr).await
}

impl ScionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> Option<StackContext> {
        self.context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// `Ok(true)` when already initialised for `ia`.
    fn initialised_for(&self, ia: IsdAs) -> ScionResult<bool> {
        match self.context() {
            Some(current) if current.ia != ia => Err(ScionError::AlreadyInitialized {
                current: current.ia,
                requested: ia,
            }),
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Check that the daemon accepts connections and the dispatcher socket
    /// exists, then remember both for [`Self::bind`].
    pub async fn init(&self, ia: IsdAs, daemon_socket: &Path, dispatcher_socket: &Path) -> ScionResult<()> {
        if self.initialised_for(ia)? {
            if log::log_enabled!(log::Level::Debug) {
                debug!("path-aware stack already initialised for {}", ia);
            }
            return Ok(());
        }

        UnixStream::connect(daemon_socket)
            .await
            .map_err(|source| ScionError::DaemonUnreachable {
                path: daemon_socket.to_path_buf(),
                source,
            })?;

        if !dispatcher_socket.exists() {
            return Err(ScionError::DispatcherMissing(dispatcher_socket.to_path_buf()));
        }

        let mut context = self
            .context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another caller may have won the race while we were connecting
        if let Some(current) = context.as_ref() {
            if current.ia != ia {
                return Err(ScionError::AlreadyInitialized {
                    current: current.ia,
                    requested: ia,
                });
            }
            return Ok(());
        }

        if log::log_enabled!(log::Level::Info) {
            info!(
                "path-aware stack initialised for {} (daemon {}, dispatcher {})",
                ia,
                daemon_socket.display(),
                dispatcher_socket.display()
            );
        }
        *context = Some(StackContext {
            ia,
            daemon_socket: daemon_socket.to_path_buf(),
            dispatcher_socket: dispatcher_socket.to_path_buf(),
        });
        Ok(())
    }

    /// Register a socket for `addr` with the dispatcher. `addr` must be in
    /// the AS the stack was initialised for.
    pub async fn bind(&self, addr: &ScionAddr) -> ScionResult<PathAwareSocket> {
        let context = self.context().ok_or(ScionError::NotInitialized)?;
        if context.ia != addr.ia {
            return Err(ScionError::ForeignAddress {
                requested: addr.ia,
                local: context.ia,
            });
        }

        let stream = UnixStream::connect(&context.dispatcher_socket).await?;
        PathAwareSocket::register(stream, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scion::testing::FakeControlPlane;

    #[test]
    fn test_daemon_socket_path() {
        let paths = StackPaths::default();
        let ia: IsdAs = "1-ff00:0:110".parse().unwrap();
        assert_eq!(
            paths.daemon_socket(&ia),
            PathBuf::from("/run/shm/sciond/sd1-280375465083152.sock")
        );
    }

    #[tokio::test]
    async fn test_init_is_idempotent_per_as() {
        let ia: IsdAs = "1-ff00:0:110".parse().unwrap();
        let plane = FakeControlPlane::start(ia).await;
        let stack = ScionStack::new();

        stack.init(ia, &plane.daemon_socket(), &plane.paths.dispatcher_socket).await.unwrap();
        stack.init(ia, &plane.daemon_socket(), &plane.paths.dispatcher_socket).await.unwrap();

        let other: IsdAs = "2-64512".parse().unwrap();
        let err = stack
            .init(other, &plane.daemon_socket(), &plane.paths.dispatcher_socket)
            .await
            .unwrap_err();
        assert!(matches!(err, ScionError::AlreadyInitialized { .. }));
        assert_eq!(stack.context().unwrap().ia, ia);
    }

    #[tokio::test]
    async fn test_init_requires_daemon() {
        let ia: IsdAs = "1-64512".parse().unwrap();
        let plane = FakeControlPlane::start(ia).await;
        let stack = ScionStack::new();
        let missing = plane.paths.daemon_dir.join("sd9-9.sock");

        let err = stack.init(ia, &missing, &plane.paths.dispatcher_socket).await.unwrap_err();
        assert!(matches!(err, ScionError::DaemonUnreachable { .. }));
        assert!(stack.context().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_init_keeps_one_as() {
        let ia: IsdAs = "1-ff00:0:110".parse().unwrap();
        let other: IsdAs = "2-64512".parse().unwrap();
        let plane = FakeControlPlane::start(ia).await;
        let stack = ScionStack::new();
        let daemon = plane.daemon_socket();

        let (first, second) = tokio::join!(
            stack.init(ia, &daemon, &plane.paths.dispatcher_socket),
            stack.init(other, &daemon, &plane.paths.dispatcher_socket),
        );
        assert_ne!(first.is_ok(), second.is_ok());
        let winner = if first.is_ok() { ia } else { other };
        let failed = if first.is_ok() { second } else { first };
        assert!(matches!(failed, Err(ScionError::AlreadyInitialized { .. })));
        assert_eq!(stack.context().unwrap().ia, winner);
    }

    #[tokio::test]
    async fn test_bind_requires_init() {
        let stack = ScionStack::new();
        let addr: ScionAddr = "1-64512,[127.0.0.1]:40000".parse().unwrap();
        assert!(matches!(stack.bind(&addr).await, Err(ScionError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_bind_and_exchange() {
        let ia: IsdAs = "1-ff00:0:110".parse().unwrap();
        let plane = FakeControlPlane::start(ia).await;
        let stack = ScionStack::new();
        stack.init(ia, &plane.daemon_socket(), &plane.paths.dispatcher_socket).await.unwrap();

        let a = stack.bind(&"1-ff00:0:110,[127.0.0.1]:40000".parse().unwrap()).await.unwrap();
        let b = stack.bind(&"1-ff00:0:110,[127.0.0.1]".parse().unwrap()).await.unwrap();
        assert_eq!(a.local_addr().port, 40000);
        assert_ne!(b.local_addr().port, 0);

        a.send_to(b"hello", b.local_addr()).await.unwrap();
        let mut buf = [0u8; 32];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(&from, a.local_addr());

        let foreign: ScionAddr = "2-64512,[127.0.0.1]:40001".parse().unwrap();
        assert!(matches!(
            stack.bind(&foreign).await,
            Err(ScionError::ForeignAddress { .. })
        ));
    }
}
