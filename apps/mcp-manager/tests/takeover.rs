mod support;

use std::sync::Arc;
use std::time::Duration;

use manager_sdk::protocol::{
    RegisterWorkerRequest, SendMcpMessageRequest, SessionFrame, WorkerType,
};
use manager_sdk::registry::{InMemoryRegistryStore, RegistryStore};
use manager_sdk::ManagerClient;
use mcp_manager::registry::{Refresh, Registry};
use mcp_manager::session::Session;
use support::*;

async fn with_worker(served: &ServedManager) -> TestResult {
    ManagerClient::new(served.url())?
        .register_worker(&RegisterWorkerRequest {
            worker_id: format!("{}-w1", served.manager.id()),
            worker_type: WorkerType::Container,
            address: "http://worker.test".into(),
        })
        .await?;
    Ok(())
}

fn session_info_owner(frames: &[SessionFrame]) -> Option<String> {
    frames.iter().find_map(|frame| match frame {
        SessionFrame::SessionInfo { session } => Some(session.manager_id.clone()),
        _ => None,
    })
}

async fn tools_list(
    client: &ManagerClient,
    id: &str,
) -> Result<Vec<SessionFrame>, Box<dyn std::error::Error>> {
    let stream = client
        .send_mcp_message(
            "s1",
            &SendMcpMessageRequest {
                messages: vec![tools_list_raw(id)],
                include_responses: true,
            },
        )
        .await?;
    Ok(collect_frames(stream).await?)
}

async fn proxy_then_takeover_scenario() -> TestResult {
    let store: Arc<dyn RegistryStore> = InMemoryRegistryStore::new();
    let owner = serve_manager("m1", store.clone()).await?;
    let peer = serve_manager("m2", store.clone()).await?;
    with_worker(&owner).await?;
    with_worker(&peer).await?;

    let owner_client = ManagerClient::new(owner.url())?;
    let peer_client = ManagerClient::new(peer.url())?;
    let ack = owner_client
        .create_session(&container_session("s1", "demo:latest"))
        .await?;
    assert_eq!(ack.manager_id, "m1");

    // Creating the same id through the peer reports the existing owner.
    let again = peer_client
        .create_session(&container_session("s1", "demo:latest"))
        .await?;
    assert_eq!(again.manager_id, "m1");
    assert_eq!(again.session_uuid, ack.session_uuid);

    let frames = tools_list(&peer_client, "2").await?;
    assert_eq!(session_info_owner(&frames).as_deref(), Some("m1"));
    assert!(matches!(
        peer.manager.sessions().cached("s1"),
        Some(Session::Remote(_))
    ));

    owner.kill();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let frames = tools_list(&peer_client, "3").await?;
    assert_eq!(session_info_owner(&frames).as_deref(), Some("m2"));
    let response = frames.iter().find_map(|frame| match frame {
        SessionFrame::McpMessage { message, .. } => message.id.clone(),
        _ => None,
    });
    assert_eq!(response.as_deref(), Some("3"));

    let registry = Registry::new(store);
    let row = registry.get_session("s1").await?.ok_or("row missing")?;
    assert_eq!(row.manager_id, "m2");
    assert_ne!(row.session_uuid, ack.session_uuid);

    // The old owner's wrapper now sees a different generation.
    let Some(Session::Local(stale)) = owner.manager.sessions().cached("s1") else {
        return Err("owner lost its local wrapper".into());
    };
    assert!(matches!(
        registry.refresh_session(stale.stored()).await?,
        Refresh::Moved(_)
    ));
    owner.manager.sessions().ping_sessions().await;
    assert!(owner.manager.sessions().cached("s1").is_none());
    assert!(stale.is_stopped());
    assert_eq!(
        registry.get_session("s1").await?.ok_or("row missing")?.manager_id,
        "m2",
        "the moved row must survive the old owner's cleanup"
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn unreachable_owner_is_taken_over() {
    proxy_then_takeover_scenario().await.unwrap();
}

async fn stop_then_lookup_scenario() -> TestResult {
    let store: Arc<dyn RegistryStore> = InMemoryRegistryStore::new();
    let owner = serve_manager("m1", store.clone()).await?;
    let peer = serve_manager("m2", store.clone()).await?;
    with_worker(&peer).await?;

    ManagerClient::new(owner.url())?
        .create_session(&container_session("s1", "demo:latest"))
        .await?;
    owner.kill();
    owner.manager.stop().await;

    let registry = Registry::new(store);
    assert!(registry.get_manager("m1").await?.is_none());

    let peer_client = ManagerClient::new(peer.url())?;
    let managers = peer_client.list_managers().await?;
    assert_eq!(managers.managers.len(), 1);
    assert_eq!(managers.managers[0].id, "m2");

    // `stop` deleted the rows the owner still held.
    let err = peer_client.get_server_info("s1").await.unwrap_err();
    assert_eq!(
        err.api_body().map(|body| body.error),
        Some(manager_sdk::protocol::ErrorKind::NotFound)
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn graceful_stop_releases_sessions() {
    stop_then_lookup_scenario().await.unwrap();
}

async fn removed_owner_scenario() -> TestResult {
    let store: Arc<dyn RegistryStore> = InMemoryRegistryStore::new();
    let registry = Registry::new(store.clone());
    let owner = serve_manager("m1", store.clone()).await?;
    let peer = serve_manager("m2", store.clone()).await?;
    with_worker(&peer).await?;

    let ack = ManagerClient::new(owner.url())?
        .create_session(&container_session("s1", "demo:latest"))
        .await?;
    owner.kill();
    // What the cleanup routine does once the crashed manager stops pinging.
    registry.delete_manager("m1").await?;

    let peer_client = ManagerClient::new(peer.url())?;
    let server = peer_client.get_server_info("s1").await?;
    assert_eq!(server.info.name, "fake-server");

    let row = registry.get_session("s1").await?.ok_or("row missing")?;
    assert_eq!(row.manager_id, "m2");
    assert_ne!(row.session_uuid, ack.session_uuid);
    let info = peer_client.manager_info().await?;
    assert_eq!(info.session_count, 1);
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn session_of_removed_manager_is_taken_over() {
    removed_owner_scenario().await.unwrap();
}
