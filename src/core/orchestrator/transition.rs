//! Mapping of operation results onto the snapshot
//!
//! Pure functions: every error kind becomes state flags here, so the
//! mapping is testable without hardware or a broker.

use super::state::{DeviceInfo, OrchestrationState, PayloadSummary};
use crate::core::broker::{BrokerError, ConnectionStatus};
use crate::core::device::{DeviceError, DeviceId, HardwareError};
use bytes::Bytes;

/// Enumeration finished; the first device becomes the selection
pub fn devices_loaded(state: &mut OrchestrationState, result: Result<Vec<DeviceInfo>, DeviceError>) {
    match result {
        Ok(devices) => {
            state.selected_device = devices.first().map(|d| d.id.clone());
            state.device_connected = devices.first().is_some_and(|d| d.connected);
            state.devices = devices;
            state.last_error = None;
        }
        Err(e) => device_failed(state, &e),
    }
}

/// Selection changed; an unknown id keeps the selection and records not-found
pub fn device_selected(state: &mut OrchestrationState, id: &DeviceId) {
    let Some(device) = state.devices.iter().find(|d| &d.id == id) else {
        state.last_error = Some(DeviceError::NotFound(id.clone()).to_string());
        return;
    };
    state.device_connected = device.connected;
    state.selected_device = Some(id.clone());
    state.last_error = None;
}

/// Port opened
pub fn device_opened(state: &mut OrchestrationState, result: Result<DeviceInfo, DeviceError>) {
    match result {
        Ok(info) => {
            state.device_connected = info.connected;
            state.device_requires_permission = false;
            state.last_error = None;
            replace_device(state, info);
        }
        Err(e) => device_failed(state, &e),
    }
}

/// Port closed
pub fn device_closed(state: &mut OrchestrationState, result: Result<DeviceInfo, DeviceError>) {
    match result {
        Ok(info) => {
            state.device_connected = info.connected;
            state.device_requires_permission = false;
            state.last_error = None;
            replace_device(state, info);
        }
        Err(e) => device_failed(state, &e),
    }
}

/// Record a device error; payload fields keep their previous values
pub fn device_failed(state: &mut OrchestrationState, error: &DeviceError) {
    state.last_error = Some(error.to_string());
    match error {
        DeviceError::PermissionDenied(_) => {
            state.device_requires_permission = true;
            state.device_permission_granted = false;
        }
        DeviceError::ConnectionClosed(_)
        | DeviceError::Hardware {
            source: HardwareError::Disconnected,
            ..
        } => state.device_connected = false,
        _ => {}
    }
}

/// Read finished
pub fn bytes_read(state: &mut OrchestrationState, result: Result<Bytes, DeviceError>) {
    match result {
        Ok(data) => {
            state.last_bytes_read = Some(PayloadSummary::new(data));
            state.last_error = None;
        }
        Err(e) => device_failed(state, &e),
    }
}

/// Write finished; `Ok` carries the payload written
pub fn bytes_written(state: &mut OrchestrationState, result: Result<Bytes, DeviceError>) {
    match result {
        Ok(data) => {
            state.last_bytes_written = Some(PayloadSummary::new(data));
            state.last_error = None;
        }
        Err(e) => device_failed(state, &e),
    }
}

/// Permission request answered
pub fn permission_result(state: &mut OrchestrationState, result: Result<bool, DeviceError>) {
    match result {
        Ok(granted) => {
            state.device_permission_granted = granted;
            state.device_requires_permission = !granted;
            if granted {
                state.last_error = None;
            }
        }
        Err(e) => device_failed(state, &e),
    }
}

/// Broker connect started
pub fn broker_connecting(state: &mut OrchestrationState) {
    state.broker_status = ConnectionStatus::Connecting;
}

/// Broker connect finished
pub fn broker_connected(state: &mut OrchestrationState, result: Result<(), BrokerError>) {
    match result {
        Ok(()) => {
            state.broker_status = ConnectionStatus::Connected;
            state.broker_last_error = None;
        }
        Err(e) => {
            state.broker_status = ConnectionStatus::Failed;
            state.broker_last_error = Some(e.to_string());
        }
    }
}

/// Broker status changed outside of an operation
pub fn broker_status_changed(state: &mut OrchestrationState, status: ConnectionStatus) {
    state.broker_status = status;
}

/// Publish finished; `Ok` carries the payload published
pub fn published(state: &mut OrchestrationState, result: Result<Bytes, BrokerError>) {
    match result {
        Ok(data) => {
            state.last_bytes_published = Some(PayloadSummary::new(data));
            state.broker_last_error = None;
        }
        Err(e) => {
            if let BrokerError::NotConnected(status) = &e {
                state.broker_status = *status;
            }
            state.broker_last_error = Some(e.to_string());
        }
    }
}

/// Inbound broker message
pub fn received(state: &mut OrchestrationState, data: Bytes) {
    state.last_bytes_received = Some(PayloadSummary::new(data));
}

fn replace_device(state: &mut OrchestrationState, info: DeviceInfo) {
    if let Some(slot) = state.devices.iter_mut().find(|d| d.id == info.id) {
        *slot = info;
    }
}
