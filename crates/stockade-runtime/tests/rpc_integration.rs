#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use stockade_common::error::{ErrorKind, Result, StockadeError};
use stockade_common::types::{
    ChdirArgs, ChrootArgs, ChrootMethod, CryptArgs, CryptReply, HostnameArgs, LoopArgs, LoopInfo,
    LoopReply, MkdirArgs, MountArgs, SetFsIdArgs,
};
use stockade_core::affinity::AffinityExecutor;
use stockade_runtime::rpc::{Methods, PrivilegedClient, PrivilegedServer, Response};
use tokio::io::duplex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Records every call and whether it ran on the affinity worker.
#[derive(Default)]
struct RecordingMethods {
    calls: Mutex<Vec<(String, bool)>>,
    fail_fs_id: bool,
    fail_decrypt_restore: bool,
}

impl RecordingMethods {
    fn record(&self, executor: &AffinityExecutor, name: &str) -> Result<()> {
        let on_worker = executor.submit({
            let executor = executor.clone();
            move || executor.is_worker()
        })?;
        self.calls.lock().unwrap().push((name.to_owned(), on_worker));
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Methods for RecordingMethods {
    fn mount(&self, executor: &AffinityExecutor, args: MountArgs) -> Result<()> {
        self.record(executor, &format!("mount {}", args.target.display()))
    }

    fn decrypt(&self, executor: &AffinityExecutor, args: CryptArgs) -> Result<CryptReply> {
        self.record(executor, "decrypt")?;
        if self.fail_decrypt_restore {
            return Err(StockadeError::NamespaceRestore {
                message: "setns back failed".into(),
            });
        }
        Ok(CryptReply {
            device: PathBuf::from(format!("/dev/mapper/{}", args.loop_device.display())),
        })
    }

    fn mkdir(&self, executor: &AffinityExecutor, args: MkdirArgs) -> Result<()> {
        self.record(executor, &format!("mkdir {} {:o}", args.path.display(), args.mode))
    }

    fn chroot(&self, executor: &AffinityExecutor, args: ChrootArgs) -> Result<()> {
        self.record(executor, &format!("chroot {}", args.method))
    }

    fn loop_device(&self, executor: &AffinityExecutor, args: LoopArgs) -> Result<LoopReply> {
        self.record(executor, "loop")?;
        Ok(LoopReply {
            index: args.max_devices - 1,
        })
    }

    fn set_hostname(&self, executor: &AffinityExecutor, args: HostnameArgs) -> Result<()> {
        self.record(executor, &format!("hostname {}", args.hostname))
    }

    fn set_fs_id(&self, executor: &AffinityExecutor, args: SetFsIdArgs) -> Result<()> {
        self.record(executor, &format!("fsid {}:{}", args.uid, args.gid))?;
        if self.fail_fs_id {
            return Err(StockadeError::IdentityRestore {
                message: "fsuid stuck".into(),
            });
        }
        Ok(())
    }

    fn chdir(&self, executor: &AffinityExecutor, args: ChdirArgs) -> Result<()> {
        self.record(executor, &format!("chdir {}", args.dir.display()))
    }
}

fn server_for(methods: Arc<RecordingMethods>) -> PrivilegedServer {
    PrivilegedServer::new(methods, AffinityExecutor::spawn().unwrap())
}

#[tokio::test]
async fn every_operation_round_trips() {
    let methods = Arc::new(RecordingMethods::default());
    let server = server_for(Arc::clone(&methods));
    let (client_stream, server_stream) = duplex(16 * 1024);
    let server_task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_stream(server_stream).await }
    });

    let mut client = PrivilegedClient::new(client_stream);
    client
        .mount(MountArgs {
            source: "proc".into(),
            target: PathBuf::from("/proc"),
            filesystem: "proc".into(),
            ..MountArgs::default()
        })
        .await
        .unwrap();
    client.mkdir(Path::new("/var/tmp"), 0o1777).await.unwrap();
    client
        .chroot(Path::new("/rootfs"), ChrootMethod::Pivot)
        .await
        .unwrap();
    let index = client
        .loop_device(LoopArgs {
            image: "/proc/self/fd/3".into(),
            mode: 0,
            max_devices: 8,
            shared: true,
            info: LoopInfo::default(),
        })
        .await
        .unwrap();
    assert_eq!(index, 7);
    let device = client
        .decrypt(CryptArgs {
            key: b"secret".to_vec(),
            loop_device: PathBuf::from("loop7"),
            master_pid: 0,
        })
        .await
        .unwrap();
    assert_eq!(device, PathBuf::from("/dev/mapper/loop7"));
    client.set_hostname("box").await.unwrap();
    client.set_fs_id(1000, 1000).await.unwrap();
    client.chdir(Path::new("/")).await.unwrap();

    drop(client);
    server_task.await.unwrap().unwrap();

    assert_eq!(
        methods.names(),
        [
            "mount /proc",
            "mkdir /var/tmp 1777",
            "chroot pivot",
            "loop",
            "decrypt",
            "hostname box",
            "fsid 1000:1000",
            "chdir /",
        ]
    );
    assert!(methods.calls.lock().unwrap().iter().all(|(_, on_worker)| *on_worker));
    assert!(!server.is_poisoned());
}

#[tokio::test]
async fn undecodable_frame_gets_config_error_and_serving_continues() {
    let methods = Arc::new(RecordingMethods::default());
    let server = server_for(Arc::clone(&methods));
    let (client_stream, server_stream) = duplex(16 * 1024);
    let server_task = tokio::spawn(async move { server.serve_stream(server_stream).await });

    let mut framed = Framed::new(client_stream, LengthDelimitedCodec::new());
    framed
        .send(Bytes::from_static(br#"{"method":"Reboot","args":{}}"#))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let response: Response = serde_json::from_slice(&frame).unwrap();
    let Response::Error(error) = response else {
        panic!("expected an error response, got {response:?}");
    };
    assert_eq!(error.kind, ErrorKind::Config);

    let mut client = PrivilegedClient::new(framed.into_inner());
    client.set_hostname("still-alive").await.unwrap();
    drop(client);
    server_task.await.unwrap().unwrap();
    assert_eq!(methods.names(), ["hostname still-alive"]);
}

#[tokio::test]
async fn identity_restore_failure_poisons_the_server() {
    let methods = Arc::new(RecordingMethods {
        fail_fs_id: true,
        ..RecordingMethods::default()
    });
    let server = server_for(Arc::clone(&methods));
    let (client_stream, server_stream) = duplex(16 * 1024);
    let server_task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_stream(server_stream).await }
    });

    let mut client = PrivilegedClient::new(client_stream);
    let err = client.set_fs_id(0, 6).await.unwrap_err();
    assert!(err.is_unsafe());

    let served = server_task.await.unwrap();
    assert!(served.is_err());
    assert!(server.is_poisoned());

    let refused = server
        .handle_request(stockade_runtime::rpc::Request::Chdir(ChdirArgs {
            dir: PathBuf::from("/"),
        }))
        .await;
    assert!(matches!(refused, Response::Error(_)));
    assert_eq!(methods.names(), ["fsid 0:6"]);
}

#[tokio::test]
async fn decrypt_namespace_restore_failure_does_not_poison() {
    let methods = Arc::new(RecordingMethods {
        fail_decrypt_restore: true,
        ..RecordingMethods::default()
    });
    let server = server_for(Arc::clone(&methods));
    let (client_stream, server_stream) = duplex(16 * 1024);
    let server_task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_stream(server_stream).await }
    });

    let mut client = PrivilegedClient::new(client_stream);
    let err = client
        .decrypt(CryptArgs {
            key: vec![1, 2, 3],
            loop_device: PathBuf::from("/dev/loop0"),
            master_pid: 1,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsafe);

    client.chdir(Path::new("/")).await.unwrap();
    drop(client);
    server_task.await.unwrap().unwrap();
    assert!(!server.is_poisoned());
}
