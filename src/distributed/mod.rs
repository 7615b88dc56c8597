//! Network transport
//!
//! The switchboard and its peers talk over TCP, one call per connection.
//!
//! # Architecture
//!
//! - **Coordinator service**: accepts peer calls in front of a `Switchboard`
//! - **Peer endpoint**: accepts switchboard calls in front of a local client or server
//! - **Remote handles**: implement the peer and switchboard traits by making calls
//!
//! # Modules
//!
//! - `protocol`: Message definitions and framing
//! - `coordinator`: Switchboard side of the transport
//! - `endpoint`: Peer side of the transport
//! - `remote`: Handles to other processes

pub mod coordinator;
pub mod endpoint;
pub mod protocol;
pub mod remote;

pub use coordinator::CoordinatorService;
pub use endpoint::PeerEndpoint;
pub use protocol::{Call, Message, Reply, ServerInfo, PROTOCOL_VERSION};
pub use remote::{RemoteClient, RemoteServer, RemoteSwitchboard};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchboardConfig;
    use crate::error::SwitchboardError;
    use crate::peer::{LocalClient, LocalServer, PeerHandle, Service, SwitchboardApi};
    use crate::switchboard::Switchboard;
    use crate::work::Payload;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Reverse;

    #[async_trait]
    impl Service for Reverse {
        async fn serve(&self, request: Payload) -> crate::error::CallResult<Payload> {
            let text: String = request.as_str().unwrap_or_default().chars().rev().collect();
            Ok(json!(text))
        }
    }

    async fn start_switchboard() -> (Arc<Switchboard>, RemoteSwitchboard) {
        let mut config = SwitchboardConfig::default();
        config.coordinator.keep_alive_interval_ms = 20;
        config.coordinator.keep_alive_max_retries = 2;
        config.coordinator.socket_timeout_ms = 5_000;
        let switchboard = Switchboard::new(config);

        let listener = CoordinatorService::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let service = Arc::new(CoordinatorService::new(switchboard.clone()));
        tokio::spawn(service.run(listener));

        (switchboard, RemoteSwitchboard::new(addr, TIMEOUT))
    }

    async fn start_endpoint(peer: PeerHandle) -> String {
        let (listener, endpoint) = PeerEndpoint::bind("127.0.0.1:0", Some("127.0.0.1"))
            .await
            .unwrap();
        tokio::spawn(Arc::new(PeerEndpoint::new(peer, TIMEOUT)).run(listener));
        endpoint
    }

    #[tokio::test]
    async fn test_remote_client_processes_a_file() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "alpha\nbeta\n").unwrap();
        let (switchboard, remote) = start_switchboard().await;

        let unreachable = remote.register_client(Arc::new(LocalClient::new(None))).await;
        assert!(matches!(unreachable, Err(SwitchboardError::Registration { .. })));

        let local = Arc::new(LocalClient::new(None));
        let endpoint = start_endpoint(PeerHandle::Client(local.clone())).await;
        let advertised = Arc::new(LocalClient::new(Some(endpoint)));
        let client_id = remote.register_client(advertised).await.unwrap();
        assert_eq!(switchboard.status().await.clients, 1);

        switchboard.process_file(&input, None, None).unwrap();
        while let Some(mut item) = remote.next_object(client_id).await.unwrap() {
            let text = item.payload().as_str().unwrap().to_uppercase();
            item.set_payload(json!(text));
            item.set_processed(true);
            remote.put_object(client_id, item, 1).await.unwrap();
        }
        switchboard.wait_until_all_files_are_done().await;
        switchboard.wait_for_dumps().await;
        assert_eq!(
            fs::read_to_string(dir.path().join("input.txt.proc")).unwrap(),
            "ALPHA\nBETA\n"
        );

        // pings and the final die call reach the local peer through its endpoint
        switchboard.cleanup().await;
        assert!(local.lifecycle().is_dead());
    }

    #[tokio::test]
    async fn test_remote_server_is_assigned_and_served() {
        let (switchboard, remote) = start_switchboard().await;

        let server = Arc::new(LocalServer::new(Reverse, 4, false, None));
        let endpoint = start_endpoint(PeerHandle::Server(server.clone())).await;
        let advertised = Arc::new(LocalServer::new(Reverse, 4, false, Some(endpoint)));
        let server_id = remote.register_server(advertised).await.unwrap();
        assert_eq!(switchboard.status().await.servers, 1);

        let client = Arc::new(LocalClient::new(None));
        let client_endpoint = start_endpoint(PeerHandle::Client(client.clone())).await;
        let client_id = remote
            .register_client(Arc::new(LocalClient::new(Some(client_endpoint))))
            .await
            .unwrap();

        let assigned = remote.get_server(client_id).await.unwrap().unwrap();
        assert_eq!(assigned.id().await.unwrap(), server_id);
        assert_eq!(assigned.serve(json!("stressed")).await.unwrap(), json!("desserts"));
        switchboard.cleanup().await;
    }

    #[tokio::test]
    async fn test_errors_cross_the_wire() {
        let (_switchboard, remote) = start_switchboard().await;
        assert!(matches!(
            remote.next_object(77).await,
            Err(SwitchboardError::UnrecognizedClient(77))
        ));
        assert_eq!(
            remote.keep_alive_interval().await.unwrap(),
            Duration::from_millis(20)
        );
        assert_eq!(remote.keep_alive_max_retries().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_switchboard_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let remote = RemoteSwitchboard::new(addr, Duration::from_millis(500));
        let err = remote.get_settings().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_endpoint_rejects_calls_for_the_other_role() {
        let endpoint = PeerEndpoint::new(PeerHandle::Client(Arc::new(LocalClient::new(None))), TIMEOUT);
        let err = endpoint.dispatch(Call::MaxClients).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::Protocol { .. }));
    }
}
