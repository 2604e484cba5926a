//! End-to-end tests for the HTTP API.
//!
//! Each test binds the router to an ephemeral port on 127.0.0.1, backed by
//! the simulated driver and an in-memory registry, and talks to it with a
//! real HTTP client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;

use vmdeck::api::create_router;
use vmdeck::api::state::ApiState;
use vmdeck::config::VmdeckConfig;
use vmdeck::driver::{Driver, SimDriver};
use vmdeck::registry::Registry;

// ---------------------------------------------------------------------------
// Test server
// ---------------------------------------------------------------------------

struct TestServer {
    base: String,
    client: reqwest::Client,
    dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(VmdeckConfig::default(), Arc::new(SimDriver::new())).await
    }

    async fn start_with(config: VmdeckConfig, sim: Arc<SimDriver>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = VmdeckConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..config
        };
        let driver: Arc<dyn Driver> = sim;
        let state =
            Arc::new(ApiState::new(config, Arc::new(Registry::in_memory()), driver).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.delete(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn create_vm(&self, name: &str) -> Value {
        let (status, vm) = self.post("/api/v1/vms", json!({ "name": name })).await;
        assert_eq!(status, StatusCode::CREATED, "{vm}");
        vm
    }

    async fn create_pool(&self, name: &str, capacity_gb: u64) -> Value {
        let path = self.dir.path().join("pools").join(name);
        let (status, pool) = self
            .post(
                "/api/v1/storage-pools",
                json!({ "name": name, "capacityGb": capacity_gb, "path": path }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{pool}");
        pool
    }

    async fn create_volume(&self, pool: &str, name: &str, size_gb: u64) -> (StatusCode, Value) {
        self.post(
            &format!("/api/v1/storage-pools/{pool}/volumes"),
            json!({ "name": name, "sizeGb": size_gb }),
        )
        .await
    }

    async fn action(&self, vm: &str, action: &str) -> (StatusCode, Value) {
        self.post(
            &format!("/api/v1/vms/{vm}/action"),
            json!({ "action": action }),
        )
        .await
    }
}

fn assert_error(body: &Value, code: &str) {
    assert_eq!(body["code"], code, "{body}");
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()), "{body}");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_driver_and_version() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["driver"], "sim");
    assert_eq!(body["version"], vmdeck::VERSION);
}

#[tokio::test]
async fn vm_lifecycle_round_trip() {
    let server = TestServer::start().await;
    let vm = server.create_vm("web-1").await;
    assert_eq!(vm["state"], "shutoff");
    let id = vm["id"].as_str().unwrap().to_string();

    let (status, vm) = server.action(&id, "start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vm["state"], "running");

    // Lookup works by name as well as id.
    let (status, vm) = server.get("/api/v1/vms/web-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vm["id"], id.as_str());

    let (status, vm) = server.action("web-1", "stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vm["state"], "shutoff");

    let (status, list) = server.get("/api/v1/vms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["vms"].as_array().unwrap().len(), 1);

    let (status, body) = server.delete(&format!("/api/v1/vms/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], id.as_str());

    let (status, body) = server.get(&format!("/api/v1/vms/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&body, "NOT_FOUND");
}

#[tokio::test]
async fn illegal_transition_and_unknown_action() {
    let server = TestServer::start().await;
    server.create_vm("vm-1").await;

    let (status, body) = server.action("vm-1", "pause").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "PRECONDITION_FAILED");

    let (status, body) = server.action("vm-1", "hibernate").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, "BAD_REQUEST");
}

#[tokio::test]
async fn snapshot_scenario() {
    let server = TestServer::start().await;
    server.create_vm("vm-1").await;

    let (status, snapshot) = server
        .post(
            "/api/v1/vms/vm-1/snapshots",
            json!({ "name": "before-upgrade", "description": "pre 2.0" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{snapshot}");
    assert_eq!(snapshot["name"], "before-upgrade");

    let (status, list) = server.get("/api/v1/vms/vm-1/snapshots").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["snapshots"].as_array().unwrap().len(), 1);

    let (status, vm) = server
        .post(
            "/api/v1/vms/vm-1/snapshots/before-upgrade/revert",
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{vm}");
    assert_eq!(vm["state"], "shutoff");

    let (status, body) = server
        .post("/api/v1/vms/vm-1/snapshots/missing/revert", json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&body, "NOT_FOUND");

    let (status, body) = server
        .delete("/api/v1/vms/vm-1/snapshots/before-upgrade")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], "before-upgrade");
}

#[tokio::test]
async fn snapshot_of_running_vm_is_rejected() {
    let server = TestServer::start().await;
    server.create_vm("vm-1").await;
    server.action("vm-1", "start").await;

    let (status, body) = server
        .post("/api/v1/vms/vm-1/snapshots", json!({ "name": "live" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "PRECONDITION_FAILED");

    let (_, list) = server.get("/api/v1/vms/vm-1/snapshots").await;
    assert!(list["snapshots"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn disk_attach_and_duplicate_target() {
    let server = TestServer::start().await;
    server.create_vm("vm-1").await;
    server.create_pool("default", 100).await;
    let (_, v1) = server.create_volume("default", "v1", 1).await;
    let (_, v2) = server.create_volume("default", "v2", 1).await;

    let (status, vm) = server
        .post(
            "/api/v1/vms/vm-1/attach-disk",
            json!({ "volumePath": v1["path"], "targetDev": "vdb" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{vm}");
    assert_eq!(vm["disks"].as_array().unwrap().len(), 1);
    assert_eq!(vm["disks"][0]["bus"], "virtio");

    let (status, body) = server
        .post(
            "/api/v1/vms/vm-1/attach-disk",
            json!({ "volumePath": v2["path"], "targetDev": "vdb" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "CONFLICT");

    let (_, vm) = server.get("/api/v1/vms/vm-1").await;
    assert_eq!(vm["disks"].as_array().unwrap().len(), 1);

    // An attached volume cannot be deleted.
    let (status, body) = server
        .delete("/api/v1/storage-pools/default/volumes/v1")
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "CONFLICT");

    let (status, vm) = server.delete("/api/v1/vms/vm-1/disks/vdb").await;
    assert_eq!(status, StatusCode::OK);
    assert!(vm["disks"].as_array().unwrap().is_empty());

    let (status, _) = server
        .delete("/api/v1/storage-pools/default/volumes/v1")
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn network_attach_and_detach() {
    let server = TestServer::start().await;
    server.create_vm("vm-1").await;

    let (status, body) = server
        .post(
            "/api/v1/vms/vm-1/attach-network",
            json!({ "networkName": "default", "model": "ne2k" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, "BAD_REQUEST");

    let (status, vm) = server
        .post(
            "/api/v1/vms/vm-1/attach-network",
            json!({ "networkName": "default", "model": "e1000" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{vm}");
    let mac = vm["nics"][0]["mac"].as_str().unwrap().to_string();
    assert!(mac.starts_with("52:54:00:"));

    let (status, vm) = server
        .delete(&format!("/api/v1/vms/vm-1/nics/{mac}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(vm["nics"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn volume_over_capacity_is_rejected() {
    let server = TestServer::start().await;
    server.create_pool("small", 100).await;

    let (status, _) = server.create_volume("small", "big", 95).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = server.create_volume("small", "v1", 10).await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_error(&body, "INSUFFICIENT_CAPACITY");

    let (_, pool) = server.get("/api/v1/storage-pools/small").await;
    assert_eq!(pool["allocationB"], 95 * vmdeck::util::GIB);

    let (_, volumes) = server.get("/api/v1/storage-pools/small/volumes").await;
    assert_eq!(volumes["volumes"].as_array().unwrap().len(), 1);

    // A pool with volumes cannot be deleted.
    let (status, body) = server.delete("/api/v1/storage-pools/small").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "CONFLICT");
}

#[tokio::test]
async fn malformed_json_gets_json_error() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .post(server.url("/api/v1/vms"))
        .header("content-type", "application/json")
        .body("{\"name\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_error(&body, "BAD_REQUEST");
}

#[tokio::test]
async fn duplicate_vm_name_conflicts() {
    let server = TestServer::start().await;
    server.create_vm("vm-1").await;
    let (status, body) = server.post("/api/v1/vms", json!({ "name": "vm-1" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, "CONFLICT");
}

#[tokio::test]
async fn image_catalog_round_trip() {
    let server = TestServer::start().await;
    let (status, image) = server
        .post(
            "/api/v1/images",
            json!({ "name": "debian-12", "kind": "iso", "sizeB": 1024, "status": "uploading" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{image}");
    assert_eq!(image["status"], "uploading");
    let id = image["id"].as_str().unwrap().to_string();

    let (status, image) = server
        .post(
            &format!("/api/v1/images/{id}/status"),
            json!({ "status": "available" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(image["status"], "available");

    let (status, image) = server.get("/api/v1/images/debian-12").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(image["id"], id.as_str());

    let (status, _) = server.delete(&format!("/api/v1/images/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let (_, list) = server.get("/api/v1/images").await;
    assert!(list["images"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn events_stream_reports_vm_changes() {
    let server = TestServer::start().await;
    let mut events = server
        .client
        .get(server.url("/api/v1/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), StatusCode::OK);

    server.create_vm("vm-1").await;

    let mut received = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = events.chunk().await.unwrap() {
            received.push_str(&String::from_utf8_lossy(&chunk));
            if received.contains("event: vmUpdated") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "no vmUpdated event in {received:?}");
    assert!(received.contains("\"name\":\"vm-1\""));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let server = TestServer::start().await;
    let (status, doc) = server.get("/api-docs/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/api/v1/vms"].is_object());
}

#[tokio::test]
async fn test_request_timeout_returns_json_error() {
    let sim = Arc::new(SimDriver::new());
    let config = VmdeckConfig {
        request_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let server = TestServer::start_with(config, sim.clone()).await;
    server.create_vm("vm-1").await;

    sim.set_latency(Some(Duration::from_millis(400)));
    let (status, body) = server.action("vm-1", "start").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_error(&body, "TIMEOUT");
    assert!(body["error"].as_str().unwrap().contains("may still complete"), "{body}");

    // The driver call was not cancelled; re-querying shows the outcome.
    sim.set_latency(None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (status, vm) = server.get("/api/v1/vms/vm-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vm["state"], "running");
}
