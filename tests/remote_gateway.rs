mod common;

use std::sync::Arc;

use common::{
    free_local_addrs, spawn_replica, test_config, AuthBehavior, JobBehavior, MockJobBackend,
    MockLifecycle, Replica,
};
use racetrack_pub::storage::MemoryTaskStorage;
use racetrack_pub::task_store::LONG_POLL_TIMEOUT;
use racetrack_pub::tunnel;

const GATEWAY_TOKEN: &str = "gw-secret";

async fn spawn_remote_gateway(lifecycle_url: &str) -> anyhow::Result<(Replica, String)> {
    let addrs = free_local_addrs(1)?;
    let mut cfg = test_config(lifecycle_url)?;
    cfg.remote_gateway_mode = true;
    cfg.remote_gateway_token = GATEWAY_TOKEN.to_string();
    let replica = spawn_replica(
        cfg,
        Arc::new(MemoryTaskStorage::new()),
        &addrs[0],
        Vec::new(),
        LONG_POLL_TIMEOUT,
    )
    .await?;
    Ok((replica, addrs[0].clone()))
}

#[tokio::test]
async fn remote_gateway_authorizes_through_tunnel() -> anyhow::Result<()> {
    let backend = MockJobBackend::spawn(JobBehavior::Respond).await?;
    let lifecycle = MockLifecycle::spawn(AuthBehavior::Allow {
        internal_name: backend.addr.clone(),
        caller: "bob".to_string(),
    })
    .await?;

    // The main instance holds the tunnel and answers authorization RPCs
    // against its local Lifecycle.
    let main_addrs = free_local_addrs(1)?;
    let main = spawn_replica(
        test_config(&lifecycle.url)?,
        Arc::new(MemoryTaskStorage::new()),
        &main_addrs[0],
        Vec::new(),
        LONG_POLL_TIMEOUT,
    )
    .await?;

    let (remote, remote_addr) = spawn_remote_gateway(&lifecycle.url).await?;
    tunnel::ensure_gateway_connection(&main.services, &remote_addr, Some(GATEWAY_TOKEN)).await;

    let client = common::http_client();
    let response = client
        .post(format!(
            "http://{remote_addr}/pub/job/adder/latest/api/v1/perform"
        ))
        .header("Accept", "application/json")
        .header("X-Racetrack-Auth", "caller-token")
        .body(r#"{"numbers": [40, 2]}"#)
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::OK,
        "remote proxied call should return 200, got {}",
        response.status()
    );
    let payload: serde_json::Value = response.json().await?;
    anyhow::ensure!(payload["result"] == 42, "job response should pass through: {payload}");

    remote.server.shutdown().await?;
    main.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn tunnel_handshake_requires_valid_token() -> anyhow::Result<()> {
    let lifecycle = MockLifecycle::spawn(AuthBehavior::Reject401).await?;
    let main_addrs = free_local_addrs(1)?;
    let main = spawn_replica(
        test_config(&lifecycle.url)?,
        Arc::new(MemoryTaskStorage::new()),
        &main_addrs[0],
        Vec::new(),
        LONG_POLL_TIMEOUT,
    )
    .await?;
    let (remote, remote_addr) = spawn_remote_gateway(&lifecycle.url).await?;

    tunnel::ensure_gateway_connection(&main.services, &remote_addr, Some("wrong-token")).await;

    // No tunnel: the remote gateway cannot authorize anything.
    let client = common::http_client();
    let response = client
        .post(format!(
            "http://{remote_addr}/pub/job/adder/latest/api/v1/perform"
        ))
        .header("Accept", "application/json")
        .body("{}")
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        "call without a tunnel should fail, got {}",
        response.status()
    );

    remote.server.shutdown().await?;
    main.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn remote_forward_proxies_to_named_backend() -> anyhow::Result<()> {
    let backend = MockJobBackend::spawn(JobBehavior::Respond).await?;
    let lifecycle = MockLifecycle::spawn(AuthBehavior::Reject404).await?;
    let (remote, remote_addr) = spawn_remote_gateway(&lifecycle.url).await?;

    let client = common::http_client();
    let response = client
        .post(format!(
            "http://{remote_addr}/pub/remote/forward/adder/0.0.1/api/v1/perform"
        ))
        .header("Accept", "application/json")
        .header("X-Racetrack-Gateway-Token", GATEWAY_TOKEN)
        .header("X-Racetrack-Job-Internal-Name", backend.addr.clone())
        .body(r#"{"numbers": [40, 2]}"#)
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::OK,
        "forwarded call should return 200, got {}",
        response.status()
    );
    let payload: serde_json::Value = response.json().await?;
    anyhow::ensure!(payload["result"] == 42, "job response should pass through: {payload}");

    // Without the internal-name header the gateway cannot route the call.
    let response = client
        .post(format!(
            "http://{remote_addr}/pub/remote/forward/adder/0.0.1/api/v1/perform"
        ))
        .header("Accept", "application/json")
        .header("X-Racetrack-Gateway-Token", GATEWAY_TOKEN)
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::BAD_REQUEST,
        "missing internal name should return 400, got {}",
        response.status()
    );

    remote.server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn remote_command_runs_shell_gated_by_token() -> anyhow::Result<()> {
    let lifecycle = MockLifecycle::spawn(AuthBehavior::Reject404).await?;
    let (remote, remote_addr) = spawn_remote_gateway(&lifecycle.url).await?;

    let client = common::http_client();
    let response = client
        .post(format!("http://{remote_addr}/pub/remote/command"))
        .header("X-Racetrack-Gateway-Token", GATEWAY_TOKEN)
        .json(&serde_json::json!({"command": "echo hello"}))
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::OK,
        "remote command should return 200, got {}",
        response.status()
    );
    let payload: serde_json::Value = response.json().await?;
    anyhow::ensure!(
        payload["output"].as_str().is_some_and(|o| o.contains("hello")),
        "command output should be returned: {payload}"
    );
    anyhow::ensure!(payload["exit_code"] == 0, "exit code should be zero: {payload}");

    let response = client
        .post(format!("http://{remote_addr}/pub/remote/command"))
        .header("X-Racetrack-Gateway-Token", "wrong-token")
        .json(&serde_json::json!({"command": "echo hello"}))
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::UNAUTHORIZED,
        "invalid gateway token should return 401, got {}",
        response.status()
    );

    remote.server.shutdown().await?;
    Ok(())
}
