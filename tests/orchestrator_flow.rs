//! End-to-end orchestrator flows over the loopback host and in-process broker

use bytes::Bytes;
use serial_bridge_core::core::broker::{BrokerBridge, ConnectionStatus, MemoryBroker, Subjects};
use serial_bridge_core::core::device::{DeviceId, DeviceRegistry, LoopbackDevice, LoopbackHost};
use serial_bridge_core::core::orchestrator::{OrchestrationState, Orchestrator};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(host: &LoopbackHost, broker: &MemoryBroker) -> Orchestrator {
    Orchestrator::new(
        Arc::new(DeviceRegistry::new(Arc::new(host.clone()))),
        Arc::new(BrokerBridge::new(Arc::new(broker.clone()), Subjects::default())),
    )
}

async fn wait_until(
    orchestrator: &Orchestrator,
    f: impl FnMut(&Arc<OrchestrationState>) -> bool,
) -> bool {
    let mut rx = orchestrator.subscribe();
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(f))
        .await
        .is_ok_and(|r| r.is_ok())
}

#[tokio::test]
async fn test_permission_flow() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(5).permission(false));
    let orchestrator = orchestrator(&host, &MemoryBroker::new());
    let id = DeviceId::from("5-0");

    let state = orchestrator.load().await;
    assert_eq!(state.selected_device, Some(id.clone()));

    let state = orchestrator.connect_device().await;
    assert!(state.device_requires_permission);
    assert!(!state.device_connected);
    assert_eq!(state.last_error.as_deref(), Some("Device: 5-0 permission denied"));

    let state = orchestrator.request_permission(id).await;
    assert!(state.device_permission_granted);
    assert!(!state.device_requires_permission);

    let state = orchestrator.connect_device().await;
    assert!(state.device_connected);
    assert_eq!(state.last_error, None);
    assert!(state.devices[0].connected);
}

#[tokio::test]
async fn test_read_then_publish() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let broker = MemoryBroker::new();
    let orchestrator = orchestrator(&host, &broker);

    let state = orchestrator.load().await;
    assert_eq!(state.broker_status, ConnectionStatus::Connected);
    orchestrator.connect_device().await;

    host.inject_rx(7, 0, b"abc");
    let state = orchestrator.read_from_device().await;
    let read = state.last_bytes_read.as_ref().expect("read recorded");
    assert_eq!(read.len, 3);
    assert_eq!(read.preview, "616263");

    let state = orchestrator.publish_last_read_to_broker().await;
    assert_eq!(broker.published("serial.outbound"), vec![Bytes::from_static(b"abc")]);
    assert_eq!(state.last_bytes_published.as_ref().map(|p| p.len), Some(3));
    assert!(!state.loading);
}

#[tokio::test]
async fn test_publish_without_broker_keeps_device_state() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let broker = MemoryBroker::new();
    broker.refuse_connections(Some("connection refused"));
    let orchestrator = orchestrator(&host, &broker);

    let state = orchestrator.load().await;
    assert_eq!(state.broker_status, ConnectionStatus::Failed);
    assert!(state.broker_last_error.is_some());
    assert_eq!(state.devices.len(), 1);

    orchestrator.connect_device().await;
    host.inject_rx(7, 0, b"x");
    orchestrator.read_from_device().await;
    let state = orchestrator.publish_last_read_to_broker().await;
    assert!(state.last_bytes_published.is_none());
    assert!(state.device_connected);
    assert!(state.last_bytes_read.is_some());
}

#[tokio::test]
async fn test_inbound_forwarded_to_device() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let broker = MemoryBroker::new();
    let orchestrator = orchestrator(&host, &broker).forward_inbound(true);

    orchestrator.load().await;
    orchestrator.connect_device().await;

    broker.deliver("serial.inbound", Bytes::from_static(b"RESET\r"));
    assert!(wait_until(&orchestrator, |s| s.last_bytes_written.is_some()).await);
    assert_eq!(host.take_tx(7, 0), b"RESET\r".to_vec());
    assert_eq!(
        orchestrator.snapshot().last_bytes_received.as_ref().map(|p| p.len),
        Some(6)
    );
}

#[tokio::test]
async fn test_manual_forward() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let broker = MemoryBroker::new();
    let orchestrator = orchestrator(&host, &broker);

    orchestrator.load().await;
    orchestrator.connect_device().await;

    let state = orchestrator.forward_last_received_to_device().await;
    assert!(state.last_bytes_written.is_none());

    broker.deliver("serial.inbound", vec![0x01, 0x02]);
    assert!(wait_until(&orchestrator, |s| s.last_bytes_received.is_some()).await);
    assert!(host.take_tx(7, 0).is_empty());

    let state = orchestrator.forward_last_received_to_device().await;
    assert_eq!(state.last_bytes_written.as_ref().map(|p| p.len), Some(2));
    assert_eq!(host.take_tx(7, 0), vec![0x01, 0x02]);
}

#[tokio::test]
async fn test_read_after_close_reports_closed() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let orchestrator = orchestrator(&host, &MemoryBroker::new());

    orchestrator.refresh_devices().await;
    orchestrator.connect_device().await;
    let state = orchestrator.disconnect_device().await;
    assert!(!state.device_connected);

    let state = orchestrator.read_from_device().await;
    assert_eq!(
        state.last_error.as_deref(),
        Some("Device: 7-0 connection is closed. You need to open the connection on port.")
    );
    assert!(state.last_bytes_read.is_none());
}

#[tokio::test]
async fn test_select_second_port() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT4232H").device_id(4).ports(4));
    let orchestrator = orchestrator(&host, &MemoryBroker::new());

    let state = orchestrator.refresh_devices().await;
    assert_eq!(state.devices.len(), 4);
    assert_eq!(state.broker_status, ConnectionStatus::Disconnected);

    orchestrator.select_device(&DeviceId::from("4-2"));
    orchestrator.connect_device().await;
    orchestrator.write_to_device(Bytes::from_static(b"hi")).await;

    assert_eq!(host.take_tx(4, 2), b"hi".to_vec());
    assert!(host.take_tx(4, 0).is_empty());
}

#[tokio::test]
async fn test_broker_outage_reaches_snapshot() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let broker = MemoryBroker::new();
    let orchestrator = orchestrator(&host, &broker);
    assert_eq!(orchestrator.load().await.broker_status, ConnectionStatus::Connected);

    broker.suspend_connections();
    assert!(
        wait_until(&orchestrator, |s| s.broker_status == ConnectionStatus::Connecting).await
    );

    broker.resume_connections();
    assert!(
        wait_until(&orchestrator, |s| s.broker_status == ConnectionStatus::Connected).await
    );
    let state = orchestrator.publish_last_read_to_broker().await;
    assert_eq!(state.broker_last_error, None);
}

#[tokio::test]
async fn test_publish_before_any_read() {
    let host = LoopbackHost::new();
    host.attach(LoopbackDevice::new("FT232R").device_id(7));
    let broker = MemoryBroker::new();
    broker.refuse_connections(Some("connection refused"));
    let orchestrator = orchestrator(&host, &broker);
    orchestrator.load().await;

    let state = orchestrator.publish_last_read_to_broker().await;
    assert!(state.last_bytes_read.is_none());
    assert_eq!(
        state.broker_last_error.as_deref(),
        Some("Broker not connected. Current status is FAILED. You need to open the connection first.")
    );

    broker.refuse_connections(None);
    orchestrator.connect_broker().await;
    let state = orchestrator.publish_last_read_to_broker().await;
    assert_eq!(broker.published("serial.outbound"), vec![Bytes::new()]);
    assert_eq!(state.last_bytes_published.as_ref().map(|p| p.len), Some(0));
    assert_eq!(state.broker_last_error, None);
}
