//! In-process daemon and dispatcher for tests.

use std::collections::HashMap;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::sync::Arc;

use tempdir::TempDir;
use tos_bootnode_common::{
    serializer::{Reader, Serializer},
    tokio::{
        net::{unix::OwnedWriteHalf, UnixListener, UnixStream},
        spawn_task,
        sync::Mutex,
    },
};

use super::address::{IsdAs, ScionAddr};
use super::socket::{read_frame, write_frame, FRAME_DATA, FRAME_REGISTER};
use super::stack::StackPaths;

type Routes = Arc<Mutex<HashMap<ScionAddr, Arc<Mutex<OwnedWriteHalf>>>>>;

pub(crate) struct FakeControlPlane {
    pub paths: StackPaths,
    ia: IsdAs,
    _dir: TempDir,
    _daemon: StdUnixListener,
}

impl FakeControlPlane {
    pub async fn start(ia: IsdAs) -> Self {
        let dir = TempDir::new("scion-stack").unwrap();
        let paths = StackPaths {
            daemon_dir: dir.path().join("sciond"),
            dispatcher_socket: dir.path().join("dispatcher").join("default.sock"),
        };
        std::fs::create_dir_all(&paths.daemon_dir).unwrap();
        std::fs::create_dir_all(paths.dispatcher_socket.parent().unwrap()).unwrap();

        let daemon = StdUnixListener::bind(paths.daemon_socket(&ia)).unwrap();
        let dispatcher = UnixListener::bind(&paths.dispatcher_socket).unwrap();
        let routes: Routes = Arc::default();

        spawn_task("fake-dispatcher", async move {
            let mut next_port = 31000u16;
            while let Ok((stream, _)) = dispatcher.accept().await {
                next_port += 1;
                spawn_task("fake-dispatcher-conn", serve(stream, routes.clone(), next_port));
            }
        });

        Self {
            paths,
            ia,
            _dir: dir,
            _daemon: daemon,
        }
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.paths.daemon_socket(&self.ia)
    }
}

async fn serve(stream: UnixStream, routes: Routes, fallback_port: u16) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let Ok((FRAME_REGISTER, payload)) = read_frame(&mut reader).await else {
        return;
    };
    let Ok(mut local) = ScionAddr::from_bytes(&payload[1..]) else {
        return;
    };
    if local.port == 0 {
        local.port = fallback_port;
    }
    if write_frame(&mut *writer.lock().await, FRAME_REGISTER, &local.port.to_be_bytes())
        .await
        .is_err()
    {
        return;
    }
    routes.lock().await.insert(local.clone(), writer);

    while let Ok((kind, payload)) = read_frame(&mut reader).await {
        if kind != FRAME_DATA {
            continue;
        }
        let mut r = Reader::new(&payload);
        let Ok(to) = ScionAddr::read(&mut r) else {
            continue;
        };
        let mut forwarded = local.to_bytes();
        forwarded.extend_from_slice(&payload[r.total_read()..]);

        let target = routes.lock().await.get(&to).cloned();
        if let Some(target) = target {
            let _ = write_frame(&mut *target.lock().await, FRAME_DATA, &forwarded).await;
        }
    }
    routes.lock().await.remove(&local);
}
