//! End-to-end checks over the real unix-socket gRPC surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use http::Uri;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tower::service_fn;

use pmem_csi::pmem_csi::csi::proto;
use pmem_csi::pmem_csi::csi::proto::controller_client::ControllerClient;
use pmem_csi::pmem_csi::csi::proto::identity_client::IdentityClient;
use pmem_csi::pmem_csi::csi::server::run_server;

use crate::support::{lvm_fixture, Fixture, MIB, TEST_DRIVER_NAME, TEST_NODE_ID};

struct RunningServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    socket: PathBuf,
}

impl RunningServer {
    async fn start(fixture: &Fixture) -> Self {
        let socket = fixture.dir.path().join("csi.sock");
        let driver = fixture.driver_arc();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_socket = socket.clone();
        let handle = tokio::spawn(async move {
            run_server(&server_socket, driver, async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("server runs");
        });

        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(socket.exists(), "server socket never appeared");

        Self {
            shutdown: Some(shutdown_tx),
            handle,
            socket,
        }
    }

    async fn connect(&self) -> Channel {
        let socket = self.socket.clone();
        let endpoint = Endpoint::try_from("http://[::]:50051")
            .expect("endpoint")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30));
        endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .expect("connect to UDS")
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.handle.await;
    }
}

fn single_writer_mount(fs_type: &str) -> proto::VolumeCapability {
    proto::VolumeCapability {
        access_mode: Some(proto::volume_capability::AccessMode {
            mode: proto::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
        access_type: Some(proto::volume_capability::AccessType::Mount(
            proto::volume_capability::MountVolume {
                fs_type: fs_type.to_string(),
                mount_flags: Vec::new(),
            },
        )),
    }
}

fn create_request(name: &str, bytes: i64) -> proto::CreateVolumeRequest {
    proto::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(proto::CapacityRange {
            required_bytes: bytes,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![single_writer_mount("ext4")],
        parameters: HashMap::new(),
        secrets: HashMap::new(),
        accessibility_requirements: None,
    }
}

#[tokio::test]
async fn identity_reports_name_and_readiness() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = IdentityClient::new(server.connect().await);

    let info = client
        .get_plugin_info(proto::GetPluginInfoRequest {})
        .await
        .expect("plugin info")
        .into_inner();
    assert_eq!(info.name, TEST_DRIVER_NAME);
    assert!(!info.vendor_version.is_empty());

    let probe = client
        .probe(proto::ProbeRequest {})
        .await
        .expect("probe")
        .into_inner();
    assert_eq!(probe.ready, Some(true));

    let capabilities = client
        .get_plugin_capabilities(proto::GetPluginCapabilitiesRequest {})
        .await
        .expect("capabilities")
        .into_inner();
    assert_eq!(capabilities.capabilities.len(), 2);

    server.stop().await;
}

#[tokio::test]
async fn volumes_round_trip_through_the_socket() {
    let fixture = lvm_fixture(&[256 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = ControllerClient::new(server.connect().await);

    let created = client
        .create_volume(create_request("pvc-1", (11 * MIB) as i64))
        .await
        .expect("create")
        .into_inner()
        .volume
        .expect("volume in response");
    assert_eq!(created.capacity_bytes, (12 * MIB) as i64);
    let topology = &created.accessible_topology[0].segments;
    assert_eq!(
        topology.get(&format!("{}/node", TEST_DRIVER_NAME)).map(String::as_str),
        Some(TEST_NODE_ID)
    );

    // Repeating the request over the wire changes nothing.
    let repeated = client
        .create_volume(create_request("pvc-1", (11 * MIB) as i64))
        .await
        .expect("repeat create")
        .into_inner()
        .volume
        .expect("volume");
    assert_eq!(repeated.volume_id, created.volume_id);

    let capacity = client
        .get_capacity(proto::GetCapacityRequest::default())
        .await
        .expect("capacity")
        .into_inner();
    assert_eq!(
        capacity.available_capacity,
        (256 * MIB - 12 * MIB) as i64
    );
    assert_eq!(capacity.maximum_volume_size, Some((244 * MIB) as i64));

    client
        .delete_volume(proto::DeleteVolumeRequest {
            volume_id: created.volume_id.clone(),
            secrets: HashMap::new(),
        })
        .await
        .expect("delete");
    client
        .delete_volume(proto::DeleteVolumeRequest {
            volume_id: created.volume_id,
            secrets: HashMap::new(),
        })
        .await
        .expect("repeat delete");

    server.stop().await;
}

#[tokio::test]
async fn list_volumes_paginates_with_offset_tokens() {
    let fixture = lvm_fixture(&[256 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = ControllerClient::new(server.connect().await);

    for name in ["pvc-a", "pvc-b", "pvc-c"] {
        client
            .create_volume(create_request(name, (8 * MIB) as i64))
            .await
            .expect("create");
    }

    let first = client
        .list_volumes(proto::ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        })
        .await
        .expect("first page")
        .into_inner();
    assert_eq!(first.entries.len(), 2);
    assert_eq!(first.next_token, "2");

    let second = client
        .list_volumes(proto::ListVolumesRequest {
            max_entries: 2,
            starting_token: first.next_token,
        })
        .await
        .expect("second page")
        .into_inner();
    assert_eq!(second.entries.len(), 1);
    assert!(second.next_token.is_empty());

    let status = client
        .list_volumes(proto::ListVolumesRequest {
            max_entries: 0,
            starting_token: "banana".to_string(),
        })
        .await
        .expect_err("invalid token");
    assert_eq!(status.code(), Code::Aborted);

    // Tokens wider than 32 bits never came from this driver.
    let status = client
        .list_volumes(proto::ListVolumesRequest {
            max_entries: 0,
            starting_token: "5000000000".to_string(),
        })
        .await
        .expect_err("overflowing token");
    assert_eq!(status.code(), Code::Aborted);

    server.stop().await;
}

#[tokio::test]
async fn unsupported_access_modes_are_rejected() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = ControllerClient::new(server.connect().await);

    let mut request = create_request("pvc-multi", (8 * MIB) as i64);
    request.volume_capabilities[0].access_mode = Some(proto::volume_capability::AccessMode {
        mode: proto::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
    });
    let status = client
        .create_volume(request)
        .await
        .expect_err("multi writer");
    assert_eq!(status.code(), Code::InvalidArgument);

    server.stop().await;
}

#[tokio::test]
async fn capacity_requests_for_other_nodes_see_nothing() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = ControllerClient::new(server.connect().await);

    let mut segments = HashMap::new();
    segments.insert(format!("{}/node", TEST_DRIVER_NAME), "other-node".to_string());
    let response = client
        .get_capacity(proto::GetCapacityRequest {
            accessible_topology: Some(proto::Topology { segments }),
            ..Default::default()
        })
        .await
        .expect("filtered capacity")
        .into_inner();
    assert_eq!(response.available_capacity, 0);
    assert_eq!(response.maximum_volume_size, Some(0));

    server.stop().await;
}

#[tokio::test]
async fn excessive_messages_are_rejected() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = ControllerClient::new(server.connect().await);

    // Enough topology segments to push the encoded request past the 4 MiB
    // limit.
    let mut segments = HashMap::new();
    for i in 0..150_000u32 {
        segments.insert(format!("topology.segment/{:07}", i), "somevalue".to_string());
    }
    let status = client
        .get_capacity(proto::GetCapacityRequest {
            accessible_topology: Some(proto::Topology { segments }),
            ..Default::default()
        })
        .await
        .expect_err("oversized request");
    assert_eq!(status.code(), Code::ResourceExhausted);
    assert!(
        status.message().contains("received message larger than max"),
        "unexpected message: {}",
        status.message()
    );

    server.stop().await;
}

#[tokio::test]
async fn validate_volume_capabilities_round_trip() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let server = RunningServer::start(&fixture).await;
    let mut client = ControllerClient::new(server.connect().await);

    let status = client
        .validate_volume_capabilities(proto::ValidateVolumeCapabilitiesRequest {
            volume_id: "unknown".to_string(),
            volume_capabilities: vec![single_writer_mount("ext4")],
            ..Default::default()
        })
        .await
        .expect_err("unknown volume");
    assert_eq!(status.code(), Code::NotFound);

    let created = client
        .create_volume(create_request("pvc-1", (8 * MIB) as i64))
        .await
        .expect("create")
        .into_inner()
        .volume
        .expect("volume");

    let confirmed = client
        .validate_volume_capabilities(proto::ValidateVolumeCapabilitiesRequest {
            volume_id: created.volume_id.clone(),
            volume_capabilities: vec![single_writer_mount("ext4")],
            ..Default::default()
        })
        .await
        .expect("validate")
        .into_inner();
    assert!(confirmed.confirmed.is_some());

    let mut multi = single_writer_mount("ext4");
    multi.access_mode = Some(proto::volume_capability::AccessMode {
        mode: proto::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
    });
    let refused = client
        .validate_volume_capabilities(proto::ValidateVolumeCapabilitiesRequest {
            volume_id: created.volume_id,
            volume_capabilities: vec![multi],
            ..Default::default()
        })
        .await
        .expect("validate refused mode")
        .into_inner();
    assert!(refused.confirmed.is_none());
    assert!(!refused.message.is_empty());

    server.stop().await;
}
